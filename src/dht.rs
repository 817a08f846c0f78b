//! A minimal Kademlia style DHT client: enough KRPC over UDP to find peers
//! for a known infohash.
//!
//! The client issues `find_node` queries to bootstrap its routing table from
//! the well known router nodes and then walks the network with an iterative
//! `get_peers` lookup. It never serves queries itself; inbound queries and
//! responses that don't match an outstanding transaction are dropped.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{Arc, Mutex},
    time::Duration,
};

use rand::Rng;
use tokio::{net::UdpSocket, sync::oneshot, task::JoinHandle, time::timeout};

use crate::{
    bencode::{self, Value},
    error::{Error, Result},
    Sha1Hash,
};

/// The well known re-entry points into the DHT network.
const BOOTSTRAP_NODES: &[&str] = &[
    "router.utorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.bittorrent.com:6881",
];

/// How long a single KRPC query may stay unanswered.
const QUERY_TIMEOUT: Duration = Duration::from_secs(4);

/// How many `get_peers` queries the iterative lookup keeps in flight.
const CONCURRENT_REQUESTS: usize = 10;

/// The routing table keeps at most this many nodes.
const ROUTING_TABLE_LIMIT: usize = 200;

/// Larger than any KRPC datagram we expect.
const MAX_DATAGRAM_LEN: usize = 2048;

/// A node of the DHT network, from a 26 byte compact node record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct NodeInfo {
    id: Sha1Hash,
    addr: SocketAddrV4,
}

/// What a node answered to `get_peers`: either peers for the infohash or
/// nodes closer to it. Both may be absent.
enum GetPeersReply {
    Peers(Vec<SocketAddr>),
    Nodes(Vec<NodeInfo>),
}

/// The table of outstanding transactions, keyed by the 2 byte transaction
/// id. A field of the client rather than anything process-global.
type PendingTable = Mutex<HashMap<[u8; 2], oneshot::Sender<Value>>>;

pub struct DhtClient {
    socket: Arc<UdpSocket>,
    /// This node's random id, generated once per client.
    node_id: Sha1Hash,
    pending: Arc<PendingTable>,
    routing_table: Mutex<VecDeque<NodeInfo>>,
    /// The background task that reads every inbound datagram and fulfils
    /// the matching waiting query.
    reader: JoinHandle<()>,
}

impl DhtClient {
    /// Binds the UDP socket, falling back to an ephemeral port when the
    /// configured one is taken, and starts the background reader.
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(socket) => socket,
            Err(e) => {
                log::warn!(
                    "DHT port {} unavailable ({}), falling back to an \
                     ephemeral port",
                    port,
                    e
                );
                UdpSocket::bind(("0.0.0.0", 0)).await?
            }
        };
        log::info!("DHT node listening on {}", socket.local_addr()?);
        let socket = Arc::new(socket);

        let pending: Arc<PendingTable> =
            Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(Self::read_loop(
            Arc::clone(&socket),
            Arc::clone(&pending),
        ));

        let mut node_id = [0; 20];
        rand::thread_rng().fill(&mut node_id[..]);

        Ok(Self {
            socket,
            node_id,
            pending,
            routing_table: Mutex::new(VecDeque::new()),
            reader,
        })
    }

    /// Deserializes every inbound datagram and hands responses to the
    /// caller waiting on the matching transaction id.
    async fn read_loop(socket: Arc<UdpSocket>, pending: Arc<PendingTable>) {
        let mut buf = [0; MAX_DATAGRAM_LEN];
        loop {
            let len = match socket.recv_from(&mut buf).await {
                Ok((len, _)) => len,
                Err(e) => {
                    log::debug!("DHT socket read error: {}", e);
                    continue;
                }
            };
            let message = match bencode::decode(&buf[..len]) {
                Ok(message) => message,
                // malformed packet, ignore
                Err(_) => continue,
            };

            // we only care about responses to our own queries; a full node
            // would also answer inbound queries here
            if message.get(b"y").and_then(Value::as_bytes) != Some(&b"r"[..]) {
                continue;
            }
            let tid = match message.get(b"t").and_then(Value::as_bytes) {
                Some(tid) if tid.len() == 2 => [tid[0], tid[1]],
                _ => continue,
            };
            let reply = match message.get(b"r") {
                Some(reply) if reply.as_dict().is_some() => reply.clone(),
                _ => continue,
            };

            let waiter = pending
                .lock()
                .expect("DHT transaction table lock poisoned")
                .remove(&tid);
            if let Some(waiter) = waiter {
                // the caller may have timed out in the meantime
                let _ = waiter.send(reply);
            }
        }
    }

    /// Sends a single KRPC query and waits for its response. `None` covers
    /// every failure: send errors, timeouts, and the client shutting down.
    async fn send_query(
        &self,
        addr: SocketAddr,
        query: &str,
        args: Vec<(&'static [u8], Value)>,
    ) -> Option<Value> {
        let tid: [u8; 2] = rand::thread_rng().gen();

        let mut message = BTreeMap::new();
        message.insert(b"t".to_vec(), Value::Bytes(tid.to_vec()));
        message.insert(b"y".to_vec(), Value::Bytes(b"q".to_vec()));
        message.insert(b"q".to_vec(), Value::Bytes(query.as_bytes().to_vec()));
        message.insert(
            b"a".to_vec(),
            Value::Dict(
                args.into_iter().map(|(k, v)| (k.to_vec(), v)).collect(),
            ),
        );
        let datagram = bencode::encode(&Value::Dict(message));

        let (waiter, response) = oneshot::channel();
        self.pending
            .lock()
            .expect("DHT transaction table lock poisoned")
            .insert(tid, waiter);

        let result = async {
            self.socket.send_to(&datagram, addr).await.ok()?;
            timeout(QUERY_TIMEOUT, response).await.ok()?.ok()
        }
        .await;

        self.pending
            .lock()
            .expect("DHT transaction table lock poisoned")
            .remove(&tid);
        result
    }

    /// Sends `find_node` and folds any returned nodes into the routing
    /// table.
    async fn find_node(&self, addr: SocketAddr, target: Sha1Hash) {
        let args = vec![
            (&b"id"[..], Value::Bytes(self.node_id.to_vec())),
            (&b"target"[..], Value::Bytes(target.to_vec())),
        ];
        let reply = match self.send_query(addr, "find_node", args).await {
            Some(reply) => reply,
            None => return,
        };
        if let Some(nodes) = reply.get(b"nodes").and_then(Value::as_bytes) {
            let mut table = self
                .routing_table
                .lock()
                .expect("DHT routing table lock poisoned");
            for node in parse_compact_nodes(nodes) {
                if !table.contains(&node) {
                    if table.len() == ROUTING_TABLE_LIMIT {
                        table.pop_front();
                    }
                    log::trace!(
                        "Learned DHT node {} ({})",
                        node.addr,
                        hex::encode(node.id)
                    );
                    table.push_back(node);
                }
            }
        }
    }

    /// Sends `get_peers` for the infohash and returns either the peers the
    /// node knows or nodes closer to the infohash.
    async fn get_peers(
        &self,
        addr: SocketAddr,
        info_hash: Sha1Hash,
    ) -> Option<GetPeersReply> {
        let args = vec![
            (&b"id"[..], Value::Bytes(self.node_id.to_vec())),
            (&b"info_hash"[..], Value::Bytes(info_hash.to_vec())),
        ];
        let reply = self.send_query(addr, "get_peers", args).await?;

        if let Some(values) = reply.get(b"values").and_then(Value::as_list) {
            let peers = values
                .iter()
                .filter_map(Value::as_bytes)
                .filter(|record| record.len() == 6)
                .map(parse_compact_peer)
                .collect();
            return Some(GetPeersReply::Peers(peers));
        }
        if let Some(nodes) = reply.get(b"nodes").and_then(Value::as_bytes) {
            return Some(GetPeersReply::Nodes(parse_compact_nodes(nodes)));
        }
        None
    }

    /// Populates the routing table by asking each well known bootstrap node
    /// for nodes near our own id.
    pub async fn bootstrap(&self) -> Result<()> {
        let mut seeds = Vec::new();
        for host in BOOTSTRAP_NODES {
            match tokio::net::lookup_host(host).await {
                Ok(addrs) => {
                    seeds.extend(addrs.filter(SocketAddr::is_ipv4))
                }
                Err(e) => {
                    log::warn!("Failed to resolve bootstrap node {}: {}", host, e)
                }
            }
        }
        self.bootstrap_from(&seeds).await
    }

    /// Bootstraps from an explicit set of nodes. Fails if the routing table
    /// is still empty afterwards, as no lookup could make progress.
    pub async fn bootstrap_from(&self, seeds: &[SocketAddr]) -> Result<()> {
        log::info!(
            "Bootstrapping into the DHT network via {} nodes",
            seeds.len()
        );
        // find_node with our own id gets us nodes near us
        futures::future::join_all(
            seeds.iter().map(|addr| self.find_node(*addr, self.node_id)),
        )
        .await;

        let node_count = self
            .routing_table
            .lock()
            .expect("DHT routing table lock poisoned")
            .len();
        if node_count == 0 {
            return Err(Error::DhtBootstrap);
        }
        log::info!("Bootstrap complete, {} nodes known", node_count);
        Ok(())
    }

    /// The iterative lookup: works through the network in batches of
    /// concurrent `get_peers` queries, feeding newly learned nodes back into
    /// the work queue, until no unqueried node remains. Returns every peer
    /// found along the way.
    ///
    /// No distance based priority is applied; it only costs latency, not
    /// correctness.
    pub async fn find_peers(&self, info_hash: Sha1Hash) -> Result<Vec<SocketAddr>> {
        {
            let table = self
                .routing_table
                .lock()
                .expect("DHT routing table lock poisoned");
            if table.is_empty() {
                drop(table);
                self.bootstrap().await?;
            }
        }
        let mut queue: VecDeque<NodeInfo> = {
            let table = self
                .routing_table
                .lock()
                .expect("DHT routing table lock poisoned");
            table.iter().copied().collect()
        };
        let mut queried: HashSet<SocketAddrV4> = HashSet::new();
        let mut found: HashSet<SocketAddr> = HashSet::new();

        log::info!(
            "Searching the DHT for peers of {}",
            hex::encode(info_hash)
        );

        while !queue.is_empty() {
            let mut batch = Vec::new();
            while batch.len() < CONCURRENT_REQUESTS {
                match queue.pop_front() {
                    Some(node) if queried.insert(node.addr) => {
                        batch.push(node)
                    }
                    Some(_) => continue,
                    None => break,
                }
            }

            let replies = futures::future::join_all(batch.iter().map(|node| {
                self.get_peers(SocketAddr::V4(node.addr), info_hash)
            }))
            .await;

            for reply in replies {
                match reply {
                    Some(GetPeersReply::Peers(peers)) => {
                        for peer in peers {
                            if found.insert(peer) {
                                log::debug!("DHT found peer {}", peer);
                            }
                        }
                    }
                    Some(GetPeersReply::Nodes(nodes)) => {
                        for node in nodes {
                            if !queried.contains(&node.addr) {
                                queue.push_back(node);
                            }
                        }
                    }
                    None => {}
                }
            }
        }

        log::info!("DHT lookup finished with {} peers", found.len());
        Ok(found.into_iter().collect())
    }
}

impl Drop for DhtClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Parses concatenated 26 byte compact node records, dropping any trailing
/// partial record.
fn parse_compact_nodes(blob: &[u8]) -> Vec<NodeInfo> {
    blob.chunks_exact(26)
        .map(|record| {
            let mut id = [0; 20];
            id.copy_from_slice(&record[..20]);
            let ip = Ipv4Addr::new(record[20], record[21], record[22], record[23]);
            let port = u16::from_be_bytes([record[24], record[25]]);
            NodeInfo {
                id,
                addr: SocketAddrV4::new(ip, port),
            }
        })
        .collect()
}

/// Parses one 6 byte compact peer record.
fn parse_compact_peer(record: &[u8]) -> SocketAddr {
    debug_assert_eq!(record.len(), 6);
    let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
    let port = u16::from_be_bytes([record[4], record[5]]);
    SocketAddr::V4(SocketAddrV4::new(ip, port))
}

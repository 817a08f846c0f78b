//! Encoding and decoding of the bencoding format, the self-describing binary
//! dictionary format used by metainfo files, tracker responses, and DHT
//! messages.
//!
//! Values form a small dynamically typed tree of integers, byte strings,
//! lists, and dictionaries with byte string keys. Decoded strings are raw
//! bytes; only a few well-known fields (torrent name, file paths, announce
//! URL) are interpreted as UTF-8, and that happens in higher layers.
//!
//! Encoding is deterministic: dictionary keys are emitted in lexicographic
//! byte order and integers are canonical. This, together with
//! [`dict_value_span`], is what makes the infohash well-defined.

use std::collections::BTreeMap;
use std::ops::Range;

/// The ways a buffer can fail to decode as bencoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BencodeError {
    #[error("unknown leading byte 0x{0:02x}")]
    UnknownType(u8),
    #[error("input ended in the middle of a value")]
    Truncated,
    #[error("missing terminator for {0}")]
    MissingTerminator(&'static str),
    #[error("byte string length is not a decimal number")]
    InvalidLength,
    #[error("integer is empty, has leading zeros, or is -0")]
    InvalidInteger,
    #[error("dictionary key is not a byte string")]
    NonStringKey,
    #[error("{0} trailing bytes after the top-level value")]
    TrailingBytes(usize),
}

type Result<T> = std::result::Result<T, BencodeError>;

/// A decoded bencoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The value as a UTF-8 string, if it is a byte string holding valid
    /// UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key if the value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }
}

/// Decodes a buffer holding exactly one bencoded value.
///
/// Fails with [`BencodeError::TrailingBytes`] if the top-level value doesn't
/// consume the whole buffer.
pub fn decode(buf: &[u8]) -> Result<Value> {
    let (value, consumed) = decode_prefix(buf)?;
    if consumed != buf.len() {
        return Err(BencodeError::TrailingBytes(buf.len() - consumed));
    }
    Ok(value)
}

/// Decodes the first bencoded value in the buffer in a single pass, returning
/// the value together with the number of bytes it occupied.
pub fn decode_prefix(buf: &[u8]) -> Result<(Value, usize)> {
    let mut decoder = Decoder { buf, pos: 0 };
    let value = decoder.parse_value()?;
    Ok((value, decoder.pos))
}

/// Returns the byte range that encodes the value of `key` within a top-level
/// bencoded dictionary.
///
/// Slicing the original buffer with the returned range yields the exact bytes
/// the value was decoded from, so a digest over the range (as done for the
/// `info` dictionary) does not depend on re-encoding at all.
pub fn dict_value_span(buf: &[u8], key: &[u8]) -> Result<Option<Range<usize>>> {
    let mut decoder = Decoder { buf, pos: 0 };
    if decoder.next_byte()? != b'd' {
        return Ok(None);
    }
    loop {
        match decoder.peek()? {
            b'e' => return Ok(None),
            _ => {
                let entry_key = decoder.parse_bytes()?;
                let start = decoder.pos;
                decoder.parse_value()?;
                if entry_key == key {
                    return Ok(Some(start..decoder.pos));
                }
            }
        }
    }
}

/// Encodes a value deterministically: dictionary keys in lexicographic byte
/// order (the map is ordered, so iteration order is already canonical) and
/// integers without leading zeros or a negative zero.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            out.push(b'd');
            for (key, item) in entries {
                encode_into(&Value::Bytes(key.clone()), out);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::Truncated)
    }

    fn next_byte(&mut self) -> Result<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn parse_value(&mut self) -> Result<Value> {
        match self.peek()? {
            b'i' => self.parse_int(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => self.parse_bytes().map(Value::Bytes),
            other => Err(BencodeError::UnknownType(other)),
        }
    }

    fn parse_int(&mut self) -> Result<Value> {
        debug_assert_eq!(self.peek(), Ok(b'i'));
        self.pos += 1;
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.buf[start..self.pos];
        // skip the terminator
        self.pos += 1;

        let negative = digits.first() == Some(&b'-');
        let unsigned = if negative { &digits[1..] } else { digits };
        // no empty integers, no leading zeros (except "0" itself), no "-0"
        let canonical = match unsigned {
            [] => false,
            [b'0'] => !negative,
            [b'0', ..] => false,
            _ => unsigned.iter().all(u8::is_ascii_digit),
        };
        if !canonical {
            return Err(BencodeError::InvalidInteger);
        }

        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Value::Int)
            .ok_or(BencodeError::InvalidInteger)
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        while self.peek()? != b':' {
            self.pos += 1;
        }
        let digits = &self.buf[start..self.pos];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(BencodeError::InvalidLength);
        }
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidLength)?;
        // skip the colon
        self.pos += 1;

        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(BencodeError::Truncated)?;
        let bytes = self.buf[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<Value> {
        debug_assert_eq!(self.peek(), Ok(b'l'));
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            if self.peek().map_err(|_| BencodeError::MissingTerminator("list"))? == b'e' {
                self.pos += 1;
                return Ok(Value::List(items));
            }
            items.push(self.parse_value()?);
        }
    }

    fn parse_dict(&mut self) -> Result<Value> {
        debug_assert_eq!(self.peek(), Ok(b'd'));
        self.pos += 1;
        let mut entries = BTreeMap::new();
        loop {
            match self
                .peek()
                .map_err(|_| BencodeError::MissingTerminator("dictionary"))?
            {
                b'e' => {
                    self.pos += 1;
                    return Ok(Value::Dict(entries));
                }
                b'0'..=b'9' => {
                    let key = self.parse_bytes()?;
                    let value = self.parse_value()?;
                    entries.insert(key, value);
                }
                _ => return Err(BencodeError::NonStringKey),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bytes(b: &[u8]) -> Value {
        Value::Bytes(b.to_vec())
    }

    fn dict(entries: Vec<(&[u8], Value)>) -> Value {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_vec(), v))
                .collect(),
        )
    }

    #[test]
    fn test_encode_dict_sorted() {
        let value = dict(vec![
            (b"spam", bytes(b"eggs")),
            (b"cow", bytes(b"moo")),
        ]);
        assert_eq!(encode(&value), b"d3:cow3:moo4:spam4:eggse".to_vec());
    }

    #[test]
    fn test_decode_list() {
        assert_eq!(
            decode(b"li42e4:spame").unwrap(),
            Value::List(vec![Value::Int(42), bytes(b"spam")])
        );
    }

    #[test]
    fn test_decode_integers() {
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
        assert_eq!(decode(b"i-3e").unwrap(), Value::Int(-3));
        assert_eq!(decode(b"i12345678901e").unwrap(), Value::Int(12_345_678_901));

        assert_eq!(decode(b"i-0e"), Err(BencodeError::InvalidInteger));
        assert_eq!(decode(b"i03e"), Err(BencodeError::InvalidInteger));
        assert_eq!(decode(b"ie"), Err(BencodeError::InvalidInteger));
        assert_eq!(decode(b"i2x3e"), Err(BencodeError::InvalidInteger));
        assert_eq!(decode(b"i42"), Err(BencodeError::Truncated));
    }

    #[test]
    fn test_decode_strings() {
        assert_eq!(decode(b"0:").unwrap(), bytes(b""));
        assert_eq!(decode(b"4:spam").unwrap(), bytes(b"spam"));
        // raw bytes are not required to be UTF-8
        assert_eq!(decode(b"2:\xff\xfe").unwrap(), bytes(b"\xff\xfe"));

        assert_eq!(decode(b"4:spa"), Err(BencodeError::Truncated));
        assert_eq!(decode(b"4x:spam"), Err(BencodeError::InvalidLength));
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert_eq!(decode(b"x"), Err(BencodeError::UnknownType(b'x')));
        assert_eq!(decode(b""), Err(BencodeError::Truncated));
        assert_eq!(
            decode(b"li42e"),
            Err(BencodeError::MissingTerminator("list"))
        );
        assert_eq!(
            decode(b"d3:cow3:moo"),
            Err(BencodeError::MissingTerminator("dictionary"))
        );
        assert_eq!(decode(b"di42ei43ee"), Err(BencodeError::NonStringKey));
        assert_eq!(decode(b"i42ei43e"), Err(BencodeError::TrailingBytes(4)));
    }

    #[test]
    fn test_decode_prefix_reports_consumed() {
        let (value, consumed) = decode_prefix(b"4:spamtrailer").unwrap();
        assert_eq!(value, bytes(b"spam"));
        assert_eq!(consumed, 6);
    }

    #[test]
    fn test_unsorted_keys_decode_and_reencode_sorted() {
        // keys arrive out of order; the decoded map re-encodes canonically
        let input = b"d4:spam4:eggs3:cow3:mooe";
        let value = decode(input).unwrap();
        assert_eq!(encode(&value), b"d3:cow3:moo4:spam4:eggse".to_vec());
    }

    #[test]
    fn test_roundtrip() {
        let value = dict(vec![
            (b"announce", bytes(b"http://tracker.example/announce")),
            (
                b"info",
                dict(vec![
                    (b"length", Value::Int(1024)),
                    (b"name", bytes(b"a.bin")),
                    (b"piece length", Value::Int(256)),
                    (
                        b"files",
                        Value::List(vec![dict(vec![
                            (b"length", Value::Int(7)),
                            (
                                b"path",
                                Value::List(vec![bytes(b"sub"), bytes(b"a")]),
                            ),
                        ])]),
                    ),
                ]),
            ),
        ]);
        assert_eq!(decode(&encode(&value)).unwrap(), value);
    }

    #[test]
    fn test_dict_value_span() {
        let buf = b"d8:announce3:url4:infod6:lengthi10e4:name1:xee".to_vec();
        let span = dict_value_span(&buf, b"info").unwrap().unwrap();
        assert_eq!(&buf[span], b"d6:lengthi10e4:name1:xe");

        assert_eq!(dict_value_span(&buf, b"missing").unwrap(), None);
        // non-dictionary top-level values have no spans
        assert_eq!(dict_value_span(b"i42e", b"info").unwrap(), None);
    }
}

//! HPACK header block decoding (RFC 7541).
//!
//! # Responsibilities
//! - Decode indexed and literal header field representations
//! - Maintain the dynamic table for the span of one header block walk
//! - Decode Huffman-coded string literals
//!
//! # Design Decisions
//! - Decode-only: the multiplexer never emits HPACK
//! - Every malformed input is an error, never a panic
//! - Huffman decoding uses the canonical-code property of the RFC table,
//!   so only the code lengths are stored

use std::collections::VecDeque;
use std::sync::OnceLock;

/// Default `SETTINGS_HEADER_TABLE_SIZE`.
pub const DEFAULT_TABLE_SIZE: usize = 4096;

/// Per-entry accounting overhead (RFC 7541 §4.1).
const ENTRY_OVERHEAD: usize = 32;

/// A decoded `(name, value)` pair.
pub type HeaderField = (Vec<u8>, Vec<u8>);

/// Error type for header block decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HpackError {
    #[error("header block truncated")]
    Truncated,
    #[error("integer representation overflows")]
    IntegerOverflow,
    #[error("invalid table index {0}")]
    InvalidIndex(usize),
    #[error("invalid huffman-coded string")]
    InvalidHuffman,
    #[error("dynamic table size update to {0} exceeds the limit")]
    TableSizeExceeded(usize),
}

const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Stateful decoder for one HTTP/2 connection direction.
#[derive(Debug)]
pub struct Decoder {
    dynamic: VecDeque<HeaderField>,
    size: usize,
    max_size: usize,
    limit: usize,
}

impl Decoder {
    /// Create a decoder whose dynamic table may grow up to `limit` octets.
    pub fn new(limit: usize) -> Self {
        Self {
            dynamic: VecDeque::new(),
            size: 0,
            max_size: limit,
            limit,
        }
    }

    /// Decode a complete header block.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>, HpackError> {
        let mut fields = Vec::new();
        let mut pos = 0;

        while pos < block.len() {
            let rest = &block[pos..];
            let first = rest[0];

            if first & 0x80 != 0 {
                // Indexed header field.
                let (index, n) = decode_integer(rest, 7)?;
                fields.push(self.lookup(index)?);
                pos += n;
            } else if first & 0x40 != 0 {
                // Literal with incremental indexing.
                let (field, n) = self.decode_literal(rest, 6)?;
                self.insert(field.clone());
                fields.push(field);
                pos += n;
            } else if first & 0x20 != 0 {
                let (size, n) = decode_integer(rest, 5)?;
                if size > self.limit {
                    return Err(HpackError::TableSizeExceeded(size));
                }
                self.max_size = size;
                self.evict();
                pos += n;
            } else {
                // Literal without indexing or never indexed.
                let (field, n) = self.decode_literal(rest, 4)?;
                fields.push(field);
                pos += n;
            }
        }

        Ok(fields)
    }

    /// Current dynamic table size in octets.
    pub fn table_size(&self) -> usize {
        self.size
    }

    fn decode_literal(&self, buf: &[u8], prefix_bits: u8) -> Result<(HeaderField, usize), HpackError> {
        let (index, mut pos) = decode_integer(buf, prefix_bits)?;
        let name = if index == 0 {
            let (name, n) = decode_string(&buf[pos..])?;
            pos += n;
            name
        } else {
            self.lookup(index)?.0
        };
        let (value, n) = decode_string(&buf[pos..])?;
        pos += n;
        Ok(((name, value), pos))
    }

    fn lookup(&self, index: usize) -> Result<HeaderField, HpackError> {
        match index {
            0 => Err(HpackError::InvalidIndex(index)),
            1..=61 => {
                let (name, value) = STATIC_TABLE[index - 1];
                Ok((name.as_bytes().to_vec(), value.as_bytes().to_vec()))
            }
            _ => self
                .dynamic
                .get(index - 62)
                .cloned()
                .ok_or(HpackError::InvalidIndex(index)),
        }
    }

    fn insert(&mut self, field: HeaderField) {
        let entry = entry_size(&field);
        if entry > self.max_size {
            self.dynamic.clear();
            self.size = 0;
            return;
        }
        self.size += entry;
        self.dynamic.push_front(field);
        self.evict();
    }

    fn evict(&mut self) {
        while self.size > self.max_size {
            match self.dynamic.pop_back() {
                Some(field) => self.size -= entry_size(&field),
                None => break,
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_SIZE)
    }
}

fn entry_size((name, value): &HeaderField) -> usize {
    name.len() + value.len() + ENTRY_OVERHEAD
}

/// Decode a prefixed integer (RFC 7541 §5.1). Returns the value and the
/// number of octets consumed.
fn decode_integer(buf: &[u8], prefix_bits: u8) -> Result<(usize, usize), HpackError> {
    let first = *buf.first().ok_or(HpackError::Truncated)?;
    let mask = 0xFFu8 >> (8 - prefix_bits);
    let mut value = (first & mask) as usize;
    if value < mask as usize {
        return Ok((value, 1));
    }

    let mut shift = 0u32;
    let mut pos = 1;
    loop {
        let byte = *buf.get(pos).ok_or(HpackError::Truncated)?;
        pos += 1;
        if shift > 28 {
            return Err(HpackError::IntegerOverflow);
        }
        value = value
            .checked_add(((byte & 0x7F) as usize) << shift)
            .ok_or(HpackError::IntegerOverflow)?;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok((value, pos));
        }
    }
}

fn decode_string(buf: &[u8]) -> Result<(Vec<u8>, usize), HpackError> {
    let first = *buf.first().ok_or(HpackError::Truncated)?;
    let (len, pos) = decode_integer(buf, 7)?;
    let end = pos.checked_add(len).ok_or(HpackError::IntegerOverflow)?;
    let raw = buf.get(pos..end).ok_or(HpackError::Truncated)?;
    let value = if first & 0x80 != 0 {
        huffman_decode(raw)?
    } else {
        raw.to_vec()
    };
    Ok((value, end))
}

/// Huffman code lengths for symbols 0..=256 (256 is EOS), RFC 7541 Appendix B.
const HUFFMAN_CODE_LENGTHS: [u8; 257] = [
    13, 23, 28, 28, 28, 28, 28, 28, 28, 24, 30, 28, 28, 30, 28, 28,
    28, 28, 28, 28, 28, 28, 30, 28, 28, 28, 28, 28, 28, 28, 28, 28,
    6, 10, 10, 12, 13, 6, 8, 11, 10, 10, 8, 11, 8, 6, 6, 6,
    5, 5, 5, 6, 6, 6, 6, 6, 6, 6, 7, 8, 15, 6, 12, 10,
    13, 6, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 8, 7, 8, 13, 19, 13, 14, 6,
    15, 5, 6, 5, 6, 5, 6, 6, 6, 5, 7, 7, 6, 6, 6, 5,
    6, 7, 6, 5, 5, 6, 7, 7, 7, 7, 7, 15, 11, 14, 13, 28,
    20, 22, 20, 20, 22, 22, 22, 23, 22, 23, 23, 23, 23, 23, 24, 23,
    24, 24, 22, 23, 24, 23, 23, 23, 23, 21, 22, 23, 22, 23, 23, 24,
    22, 21, 20, 22, 22, 23, 23, 21, 23, 22, 22, 24, 21, 22, 23, 23,
    21, 21, 22, 21, 23, 22, 23, 23, 20, 22, 22, 22, 23, 22, 22, 23,
    26, 26, 20, 19, 22, 23, 22, 25, 26, 26, 26, 27, 27, 26, 24, 25,
    19, 21, 26, 27, 27, 26, 27, 24, 21, 21, 26, 26, 28, 27, 27, 27,
    20, 24, 20, 21, 22, 21, 21, 23, 22, 22, 25, 25, 24, 24, 26, 23,
    26, 27, 26, 26, 27, 27, 27, 27, 27, 28, 27, 27, 27, 27, 27, 26,
    30,
];

const MAX_CODE_LENGTH: usize = 30;
const EOS: u16 = 256;

/// Canonical decoding table: for each code length, the first code of that
/// length, how many codes share it, and where they start in `symbols`.
struct HuffmanTable {
    first_code: [u32; MAX_CODE_LENGTH + 1],
    count: [u32; MAX_CODE_LENGTH + 1],
    offset: [usize; MAX_CODE_LENGTH + 1],
    symbols: Vec<u16>,
}

fn huffman_table() -> &'static HuffmanTable {
    static TABLE: OnceLock<HuffmanTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut count = [0u32; MAX_CODE_LENGTH + 1];
        for &len in HUFFMAN_CODE_LENGTHS.iter() {
            count[len as usize] += 1;
        }

        let mut symbols = Vec::with_capacity(HUFFMAN_CODE_LENGTHS.len());
        let mut offset = [0usize; MAX_CODE_LENGTH + 1];
        let mut first_code = [0u32; MAX_CODE_LENGTH + 1];
        let mut code = 0u32;
        for len in 1..=MAX_CODE_LENGTH {
            code = (code + count[len - 1]) << 1;
            first_code[len] = code;
            offset[len] = symbols.len();
            for (symbol, &l) in HUFFMAN_CODE_LENGTHS.iter().enumerate() {
                if l as usize == len {
                    symbols.push(symbol as u16);
                }
            }
        }

        HuffmanTable {
            first_code,
            count,
            offset,
            symbols,
        }
    })
}

fn huffman_decode(input: &[u8]) -> Result<Vec<u8>, HpackError> {
    let table = huffman_table();
    let mut out = Vec::with_capacity(input.len() * 8 / 5);
    let mut code = 0u32;
    let mut len = 0usize;

    for &byte in input {
        for shift in (0..8).rev() {
            code = (code << 1) | u32::from((byte >> shift) & 1);
            len += 1;

            let first = table.first_code[len];
            if code >= first && code - first < table.count[len] {
                let symbol = table.symbols[table.offset[len] + (code - first) as usize];
                if symbol == EOS {
                    return Err(HpackError::InvalidHuffman);
                }
                out.push(symbol as u8);
                code = 0;
                len = 0;
            } else if len == MAX_CODE_LENGTH {
                return Err(HpackError::InvalidHuffman);
            }
        }
    }

    // Padding must be a strict prefix of EOS (all ones) shorter than a byte.
    if len > 7 || code != (1u32 << len) - 1 {
        return Err(HpackError::InvalidHuffman);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn pairs(fields: &[HeaderField]) -> Vec<(String, String)> {
        fields
            .iter()
            .map(|(n, v)| {
                (
                    String::from_utf8(n.clone()).unwrap(),
                    String::from_utf8(v.clone()).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn decodes_plain_literals() {
        let mut decoder = Decoder::default();
        let fields = decoder
            .decode(&hex("828684410f7777772e6578616d706c652e636f6d"))
            .unwrap();
        assert_eq!(
            pairs(&fields),
            vec![
                (":method".into(), "GET".into()),
                (":scheme".into(), "http".into()),
                (":path".into(), "/".into()),
                (":authority".into(), "www.example.com".into()),
            ]
        );
        assert_eq!(decoder.table_size(), 57);
    }

    #[test]
    fn decodes_huffman_and_dynamic_references() {
        let mut decoder = Decoder::default();
        let first = decoder
            .decode(&hex("828684418cf1e3c2e5f23a6ba0ab90f4ff"))
            .unwrap();
        assert_eq!(pairs(&first)[3], (":authority".into(), "www.example.com".into()));

        let second = decoder.decode(&hex("828684be5886a8eb10649cbf")).unwrap();
        let second = pairs(&second);
        assert_eq!(second[3], (":authority".into(), "www.example.com".into()));
        assert_eq!(second[4], ("cache-control".into(), "no-cache".into()));
    }

    #[test]
    fn decodes_grpc_request_headers() {
        let block = hex(
            "83864495626b2b22f394742675fb857c651d099d8bd3949d7f4186a0e41d139d095f8b1d75d0620d263d4c4d65644082497f864d833505b11f",
        );
        let fields = pairs(&Decoder::default().decode(&block).unwrap());
        assert!(fields.contains(&("content-type".into(), "application/grpc".into())));
        assert!(fields.contains(&(":path".into(), "/grpc.health.v1.Health/Check".into())));
        assert!(fields.contains(&("te".into(), "trailers".into())));
    }

    #[test]
    fn rejects_truncated_and_invalid_input() {
        let mut decoder = Decoder::default();
        assert_eq!(decoder.decode(&[0x41, 0x0f, b'w']), Err(HpackError::Truncated));
        assert_eq!(decoder.decode(&[0x80]), Err(HpackError::InvalidIndex(0)));
        assert_eq!(decoder.decode(&[0xbe]), Err(HpackError::InvalidIndex(62)));
        assert_eq!(decoder.decode(&[0x3f, 0xe1, 0x7f]), Err(HpackError::TableSizeExceeded(16_384)));
        assert!(decoder.decode(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn rejects_bad_huffman_padding() {
        // A full byte of padding is not allowed.
        assert_eq!(huffman_decode(&[0xff]), Err(HpackError::InvalidHuffman));
        // Padding made of zeros is not a prefix of EOS.
        assert_eq!(huffman_decode(&[0x00]), Err(HpackError::InvalidHuffman));
    }
}

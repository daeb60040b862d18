//! QPACK field compression without a dynamic table (RFC 9204).
//!
//! The client advertises a zero-capacity dynamic table, so every field
//! section it sends or accepts uses only the static table and literals.
//! Any reference to the dynamic table is a decoding failure.

use crate::error::H3Error;
use crate::huffman;

/// A single header name-value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Pseudo-header fields (`:status`, `:path`, ...).
    pub fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }
}

// ── Prefix integers (RFC 9204 Section 4.1.1) ───────────────────────

fn encode_prefix_int(buf: &mut Vec<u8>, value: u64, prefix_bits: u8, pattern: u8) {
    let max = (1u64 << prefix_bits) - 1;
    if value < max {
        buf.push(pattern | value as u8);
        return;
    }
    buf.push(pattern | max as u8);
    let mut rest = value - max;
    loop {
        let low = (rest & 0x7f) as u8;
        rest >>= 7;
        if rest == 0 {
            buf.push(low);
            break;
        }
        buf.push(0x80 | low);
    }
}

/// Returns `(value, bytes_consumed)`, or `None` when truncated or too large.
fn decode_prefix_int(buf: &[u8], prefix_bits: u8) -> Option<(u64, usize)> {
    let max = (1u64 << prefix_bits) - 1;
    let first = u64::from(*buf.first()?) & max;
    if first < max {
        return Some((first, 1));
    }
    let mut value = max;
    for (i, &b) in buf[1..].iter().enumerate() {
        let shift = 7 * i as u32;
        if shift > 56 {
            return None;
        }
        value = value.checked_add(u64::from(b & 0x7f) << shift)?;
        if b & 0x80 == 0 {
            return Some((value, i + 2));
        }
    }
    None
}

/// QPACK static table (RFC 9204 Appendix A): (name, value), indexed 0..98.
const STATIC_TABLE: &[(&[u8], &[u8])] = &[
    (b":authority", b""),                                    // 0
    (b":path", b"/"),                                        // 1
    (b"age", b"0"),                                          // 2
    (b"content-disposition", b""),                           // 3
    (b"content-length", b"0"),                               // 4
    (b"cookie", b""),                                        // 5
    (b"date", b""),                                          // 6
    (b"etag", b""),                                          // 7
    (b"if-modified-since", b""),                             // 8
    (b"if-none-match", b""),                                 // 9
    (b"last-modified", b""),                                 // 10
    (b"link", b""),                                          // 11
    (b"location", b""),                                      // 12
    (b"referer", b""),                                       // 13
    (b"set-cookie", b""),                                    // 14
    (b":method", b"CONNECT"),                                // 15
    (b":method", b"DELETE"),                                 // 16
    (b":method", b"GET"),                                    // 17
    (b":method", b"HEAD"),                                   // 18
    (b":method", b"OPTIONS"),                                // 19
    (b":method", b"POST"),                                   // 20
    (b":method", b"PUT"),                                    // 21
    (b":scheme", b"http"),                                   // 22
    (b":scheme", b"https"),                                  // 23
    (b":status", b"103"),                                    // 24
    (b":status", b"200"),                                    // 25
    (b":status", b"304"),                                    // 26
    (b":status", b"404"),                                    // 27
    (b":status", b"503"),                                    // 28
    (b"accept", b"*/*"),                                     // 29
    (b"accept", b"application/dns-message"),                 // 30
    (b"accept-encoding", b"gzip, deflate, br"),              // 31
    (b"accept-ranges", b"bytes"),                            // 32
    (b"access-control-allow-headers", b"cache-control"),     // 33
    (b"access-control-allow-headers", b"content-type"),      // 34
    (b"access-control-allow-origin", b"*"),                  // 35
    (b"cache-control", b"max-age=0"),                        // 36
    (b"cache-control", b"max-age=2592000"),                  // 37
    (b"cache-control", b"max-age=604800"),                   // 38
    (b"cache-control", b"no-cache"),                         // 39
    (b"cache-control", b"no-store"),                         // 40
    (b"cache-control", b"public, max-age=31536000"),         // 41
    (b"content-encoding", b"br"),                            // 42
    (b"content-encoding", b"gzip"),                          // 43
    (b"content-type", b"application/dns-message"),           // 44
    (b"content-type", b"application/javascript"),            // 45
    (b"content-type", b"application/json"),                  // 46
    (b"content-type", b"application/x-www-form-urlencoded"), // 47
    (b"content-type", b"image/gif"),                         // 48
    (b"content-type", b"image/jpeg"),                        // 49
    (b"content-type", b"image/png"),                         // 50
    (b"content-type", b"text/css"),                          // 51
    (b"content-type", b"text/html; charset=utf-8"),          // 52
    (b"content-type", b"text/plain"),                        // 53
    (b"content-type", b"text/plain;charset=utf-8"),          // 54
    (b"range", b"bytes=0-"),                                 // 55
    (b"strict-transport-security", b"max-age=31536000"),     // 56
    (
        b"strict-transport-security",
        b"max-age=31536000; includesubdomains",
    ), // 57
    (
        b"strict-transport-security",
        b"max-age=31536000; includesubdomains; preload",
    ), // 58
    (b"vary", b"accept-encoding"),                           // 59
    (b"vary", b"origin"),                                    // 60
    (b"x-content-type-options", b"nosniff"),                 // 61
    (b"x-xss-protection", b"1; mode=block"),                 // 62
    (b":status", b"100"),                                    // 63
    (b":status", b"204"),                                    // 64
    (b":status", b"206"),                                    // 65
    (b":status", b"302"),                                    // 66
    (b":status", b"400"),                                    // 67
    (b":status", b"403"),                                    // 68
    (b":status", b"421"),                                    // 69
    (b":status", b"425"),                                    // 70
    (b":status", b"500"),                                    // 71
    (b"accept-language", b""),                               // 72
    (b"access-control-allow-credentials", b"FALSE"),         // 73
    (b"access-control-allow-credentials", b"TRUE"),          // 74
    (b"access-control-allow-headers", b"*"),                 // 75
    (b"access-control-allow-methods", b"get"),               // 76
    (b"access-control-allow-methods", b"get, post, options"), // 77
    (b"access-control-allow-methods", b"options"),           // 78
    (b"access-control-expose-headers", b"content-length"),   // 79
    (b"access-control-request-headers", b"content-type"),    // 80
    (b"access-control-request-method", b"get"),              // 81
    (b"access-control-request-method", b"post"),             // 82
    (b"alt-svc", b"clear"),                                  // 83
    (b"authorization", b""),                                 // 84
    (
        b"content-security-policy",
        b"script-src 'none'; object-src 'none'; base-uri 'none'",
    ), // 85
    (b"early-data", b"1"),                                   // 86
    (b"expect-ct", b""),                                     // 87
    (b"forwarded", b""),                                     // 88
    (b"if-range", b""),                                      // 89
    (b"origin", b""),                                        // 90
    (b"purpose", b"prefetch"),                               // 91
    (b"server", b""),                                        // 92
    (b"timing-allow-origin", b"*"),                          // 93
    (b"upgrade-insecure-requests", b"1"),                    // 94
    (b"user-agent", b""),                                    // 95
    (b"x-forwarded-for", b""),                               // 96
    (b"x-frame-options", b"deny"),                           // 97
    (b"x-frame-options", b"sameorigin"),                     // 98
];

fn find_static(name: &[u8], value: &[u8]) -> (Option<usize>, Option<usize>) {
    let mut name_match = None;
    for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
        if *n == name {
            if *v == value {
                return (Some(i), Some(i));
            }
            name_match.get_or_insert(i);
        }
    }
    (None, name_match)
}

// ── Encoder ─────────────────────────────────────────────────────────

/// Append a string literal whose length prefix has `prefix_bits` bits and
/// whose Huffman flag is the bit just above the prefix. Huffman coding is
/// used only when it is strictly shorter.
fn encode_string(buf: &mut Vec<u8>, data: &[u8], prefix_bits: u8, pattern: u8) {
    let huffman_flag = 1u8 << prefix_bits;
    let huf_len = huffman::encoded_len(data);
    if huf_len < data.len() {
        encode_prefix_int(buf, huf_len as u64, prefix_bits, pattern | huffman_flag);
        huffman::encode(data, buf);
    } else {
        encode_prefix_int(buf, data.len() as u64, prefix_bits, pattern);
        buf.extend_from_slice(data);
    }
}

/// Encode a field section (static table and literals only).
pub fn encode(headers: &[HeaderField], buf: &mut Vec<u8>) {
    // Required Insert Count = 0, Delta Base = 0.
    buf.extend_from_slice(&[0x00, 0x00]);

    for header in headers {
        match find_static(&header.name, &header.value) {
            (Some(index), _) => {
                // Indexed field line, static: 11xxxxxx
                encode_prefix_int(buf, index as u64, 6, 0xc0);
            }
            (None, Some(name_index)) => {
                // Literal with static name reference: 0101xxxx
                encode_prefix_int(buf, name_index as u64, 4, 0x50);
                encode_string(buf, &header.value, 7, 0x00);
            }
            (None, None) => {
                // Literal with literal name: 0010Hxxx
                encode_string(buf, &header.name, 3, 0x20);
                encode_string(buf, &header.value, 7, 0x00);
            }
        }
    }
}

// ── Decoder ─────────────────────────────────────────────────────────

/// Cursor over a field section.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn int(&mut self, prefix_bits: u8) -> Result<u64, H3Error> {
        let (value, n) = decode_prefix_int(&self.buf[self.pos..], prefix_bits)
            .ok_or(H3Error::QpackDecodingFailed)?;
        self.pos += n;
        Ok(value)
    }

    fn string(&mut self, prefix_bits: u8) -> Result<Vec<u8>, H3Error> {
        let first = self.peek().ok_or(H3Error::QpackDecodingFailed)?;
        let huffman_coded = first & (1 << prefix_bits) != 0;
        let len = usize::try_from(self.int(prefix_bits)?)
            .map_err(|_| H3Error::QpackDecodingFailed)?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(H3Error::QpackDecodingFailed)?;
        let raw = &self.buf[self.pos..end];
        self.pos = end;
        if huffman_coded {
            huffman::decode(raw)
        } else {
            Ok(raw.to_vec())
        }
    }

    fn static_entry(
        &mut self,
        prefix_bits: u8,
    ) -> Result<&'static (&'static [u8], &'static [u8]), H3Error> {
        let index = self.int(prefix_bits)?;
        usize::try_from(index)
            .ok()
            .and_then(|i| STATIC_TABLE.get(i))
            .ok_or(H3Error::QpackDecodingFailed)
    }
}

/// Decode a field section that references no dynamic table entries.
pub fn decode(buf: &[u8]) -> Result<Vec<HeaderField>, H3Error> {
    let mut r = Reader { buf, pos: 0 };

    if r.int(8)? != 0 {
        // Required Insert Count > 0 means dynamic table references.
        return Err(H3Error::QpackDecodingFailed);
    }
    if r.peek().is_none() {
        return Err(H3Error::QpackDecodingFailed);
    }
    r.int(7)?; // Delta Base, meaningless without a dynamic table

    let mut headers = Vec::new();
    while let Some(first) = r.peek() {
        let field = if first & 0x80 != 0 {
            // Indexed field line: 1Txxxxxx
            if first & 0x40 == 0 {
                return Err(H3Error::QpackDecodingFailed);
            }
            let (name, value) = r.static_entry(6)?;
            HeaderField::new(*name, *value)
        } else if first & 0x40 != 0 {
            // Literal with name reference: 01NTxxxx
            if first & 0x10 == 0 {
                return Err(H3Error::QpackDecodingFailed);
            }
            let (name, _) = r.static_entry(4)?;
            HeaderField::new(*name, r.string(7)?)
        } else if first & 0x20 != 0 {
            // Literal with literal name: 001NHxxx
            let name = r.string(3)?;
            HeaderField::new(name, r.string(7)?)
        } else {
            // Post-base forms (0001xxxx, 0000xxxx) need a dynamic table.
            return Err(H3Error::QpackDecodingFailed);
        };
        headers.push(field);
    }

    Ok(headers)
}

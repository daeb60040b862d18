use crate::frame::{decode_varint, encode_varint, varint_len};

const SETTINGS_QPACK_MAX_TABLE_CAPACITY: u64 = 0x01;
const SETTINGS_MAX_FIELD_SECTION_SIZE: u64 = 0x06;
const SETTINGS_QPACK_BLOCKED_STREAMS: u64 = 0x07;

/// HTTP/2 setting identifiers that MUST NOT appear in HTTP/3 SETTINGS
/// (RFC 9114 Section 7.2.4.1).
const RESERVED_H2_SETTINGS: &[u64] = &[0x00, 0x02, 0x03, 0x04, 0x05];

/// HTTP/3 SETTINGS parameters (RFC 9114 Section 7.2.4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// SETTINGS_QPACK_MAX_TABLE_CAPACITY. Always 0: no dynamic table.
    pub qpack_max_table_capacity: u64,
    /// SETTINGS_MAX_FIELD_SECTION_SIZE. `None` means unlimited.
    pub max_field_section_size: Option<u64>,
    /// SETTINGS_QPACK_BLOCKED_STREAMS. Always 0.
    pub qpack_blocked_streams: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            qpack_max_table_capacity: 0,
            max_field_section_size: None,
            qpack_blocked_streams: 0,
        }
    }
}

impl Settings {
    fn pairs(&self) -> impl Iterator<Item = (u64, u64)> {
        [
            (self.qpack_max_table_capacity != 0)
                .then_some((SETTINGS_QPACK_MAX_TABLE_CAPACITY, self.qpack_max_table_capacity)),
            self.max_field_section_size
                .map(|v| (SETTINGS_MAX_FIELD_SECTION_SIZE, v)),
            (self.qpack_blocked_streams != 0)
                .then_some((SETTINGS_QPACK_BLOCKED_STREAMS, self.qpack_blocked_streams)),
        ]
        .into_iter()
        .flatten()
    }

    /// Encode non-default settings as (identifier, value) varint pairs.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        for (id, value) in self.pairs() {
            encode_varint(buf, id);
            encode_varint(buf, value);
        }
    }

    /// Byte length when encoded.
    pub fn encoded_len(&self) -> usize {
        self.pairs()
            .map(|(id, value)| varint_len(id) + varint_len(value))
            .sum()
    }

    /// Decode a SETTINGS payload. Unknown identifiers are ignored; reserved
    /// HTTP/2 identifiers and truncated pairs are errors.
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        let mut settings = Settings::default();
        while !buf.is_empty() {
            let (id, n) = decode_varint(buf)?;
            buf = &buf[n..];
            let (value, n) = decode_varint(buf)?;
            buf = &buf[n..];
            match id {
                SETTINGS_QPACK_MAX_TABLE_CAPACITY => settings.qpack_max_table_capacity = value,
                SETTINGS_MAX_FIELD_SECTION_SIZE => settings.max_field_section_size = Some(value),
                SETTINGS_QPACK_BLOCKED_STREAMS => settings.qpack_blocked_streams = value,
                id if RESERVED_H2_SETTINGS.contains(&id) => return None,
                _ => {}
            }
        }
        Some(settings)
    }
}

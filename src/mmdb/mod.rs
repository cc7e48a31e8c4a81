//! Network-free IP geolocation from MaxMind-format database files
//!
//! A database is a binary search tree over address bits, a 16-byte separator,
//! a data section of tagged values, and a metadata map found by scanning
//! backwards for [`METADATA_MARKER`].

pub mod decoder;
pub mod error;
#[cfg(test)]
pub(crate) mod testutil;

pub use decoder::{Decoder, Value};
pub use error::{DecodeError, FormatError};

use std::net::Ipv4Addr;
use std::path::Path;

/// `\xAB\xCD\xEF` followed by `MaxMind.com`.
pub const METADATA_MARKER: &[u8; 14] = b"\xab\xcd\xefMaxMind.com";

/// Zero bytes between the search tree and the data section.
const DATA_SEPARATOR: usize = 16;

/// Fields of the metadata map the reader needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub node_count: u32,
    pub record_size: u16,
    pub ip_version: u16,
    pub database_type: Option<String>,
    pub languages: Vec<String>,
    pub build_epoch: Option<u64>,
}

impl Metadata {
    fn from_value(value: &Value) -> Result<Self, FormatError> {
        if !matches!(value, Value::Map(_)) {
            return Err(FormatError::InvalidMetadata);
        }
        let number = |key: &'static str| {
            value
                .get(key)
                .and_then(Value::as_u64)
                .ok_or(FormatError::MissingField(key))
        };

        let node_count =
            u32::try_from(number("node_count")?).map_err(|_| FormatError::MissingField("node_count"))?;
        let record_size = number("record_size")?;
        if !matches!(record_size, 24 | 28 | 32) {
            return Err(FormatError::UnsupportedRecordSize(record_size));
        }
        let ip_version = number("ip_version")?;
        if !matches!(ip_version, 4 | 6) {
            return Err(FormatError::UnsupportedIpVersion(ip_version));
        }

        Ok(Self {
            node_count,
            record_size: record_size as u16,
            ip_version: ip_version as u16,
            database_type: value
                .get("database_type")
                .and_then(Value::as_str)
                .map(String::from),
            languages: value
                .get("languages")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            build_epoch: value.get("build_epoch").and_then(Value::as_u64),
        })
    }
}

/// A loaded geolocation database.
#[derive(Debug)]
pub struct Database {
    buf: Vec<u8>,
    metadata: Metadata,
    node_bytes: usize,
    data_start: usize,
    ipv4_start: u32,
}

impl Database {
    /// Read and load a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FormatError> {
        Self::load(std::fs::read(path)?)
    }

    /// Load a database from memory.
    ///
    /// Fails if the metadata marker is missing or the metadata does not
    /// describe a tree that fits in the buffer.
    pub fn load(buf: Vec<u8>) -> Result<Self, FormatError> {
        let marker = find_marker(&buf).ok_or(FormatError::MissingMarker)?;
        let metadata_start = marker + METADATA_MARKER.len();
        let (raw, _) = Decoder::new(&buf, metadata_start).decode(metadata_start)?;
        let metadata = Metadata::from_value(&raw)?;

        let node_bytes = usize::from(metadata.record_size) * 2 / 8;
        let tree = metadata.node_count as usize * node_bytes;
        let data_start = tree + DATA_SEPARATOR;
        if data_start > marker {
            return Err(FormatError::TruncatedTree { tree, marker });
        }

        let mut db = Self {
            buf,
            metadata,
            node_bytes,
            data_start,
            ipv4_start: 0,
        };
        if db.metadata.ip_version == 6 {
            db.ipv4_start = db.find_ipv4_start()?;
        }
        Ok(db)
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Look up the record for an IPv4 address. `Ok(None)` means the address
    /// has no record.
    pub fn lookup(&self, ip: Ipv4Addr) -> Result<Option<Value>, DecodeError> {
        let bits = u32::from(ip);
        let mut node = self.ipv4_start;
        for depth in 0..32 {
            if node >= self.metadata.node_count {
                break;
            }
            let bit = (bits >> (31 - depth)) & 1;
            node = self.child(node, bit)?;
        }
        self.resolve(node)
    }

    /// Parse and look up an address string. Anything but IPv4 has no record.
    pub fn lookup_str(&self, ip: &str) -> Result<Option<Value>, DecodeError> {
        match ip.trim().parse::<Ipv4Addr>() {
            Ok(ip) => self.lookup(ip),
            Err(_) => Ok(None),
        }
    }

    /// IPv4 addresses live under `::/96` in an IPv6 tree. Following 96 zero
    /// bits from the root reaches that subtree (node 96 for trees written in
    /// insertion order).
    fn find_ipv4_start(&self) -> Result<u32, DecodeError> {
        let mut node = 0;
        for _ in 0..96 {
            if node >= self.metadata.node_count {
                break;
            }
            node = self.child(node, 0)?;
        }
        Ok(node)
    }

    fn child(&self, node: u32, bit: u32) -> Result<u32, DecodeError> {
        let offset = node as usize * self.node_bytes;
        let record = self
            .buf
            .get(offset..offset + self.node_bytes)
            .ok_or(DecodeError::OutOfBounds {
                offset,
                len: self.node_bytes,
                size: self.buf.len(),
            })?;
        let be = |bytes: &[u8]| bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b));

        Ok(match (self.metadata.record_size, bit) {
            (24, 0) => be(&record[0..3]),
            (24, _) => be(&record[3..6]),
            (28, 0) => (u32::from(record[3] & 0xf0) << 20) | be(&record[0..3]),
            (28, _) => (u32::from(record[3] & 0x0f) << 24) | be(&record[4..7]),
            (_, 0) => be(&record[0..4]),
            (_, _) => be(&record[4..8]),
        })
    }

    fn resolve(&self, record: u32) -> Result<Option<Value>, DecodeError> {
        let count = self.metadata.node_count;
        if record <= count {
            // Either the empty record or we ran out of address bits inside the tree.
            return Ok(None);
        }
        let relative = (record - count)
            .checked_sub(DATA_SEPARATOR as u32)
            .ok_or(DecodeError::InvalidRecord(record))?;
        let offset = self.data_start + relative as usize;
        let (value, _) = Decoder::new(&self.buf, self.data_start).decode(offset)?;
        Ok(Some(value))
    }
}

fn find_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(METADATA_MARKER.len())
        .rposition(|window| window == METADATA_MARKER)
}

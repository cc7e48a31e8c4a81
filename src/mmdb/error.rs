//! Error types for the geolocation database reader

use thiserror::Error;

/// Failure while decoding a value from the data or metadata section.
///
/// These are never swallowed: a database that produces them is corrupt or the
/// reader is buggy, and either way its answers cannot be trusted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// A read ran past the end of the buffer.
    #[error("read of {len} bytes at offset {offset} exceeds buffer of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    /// A map key decoded to something other than a string.
    #[error("map key at offset {0} is not a string")]
    InvalidMapKey(usize),

    /// A fixed-width type carried a payload size it cannot have.
    #[error("invalid payload size {size} for {kind} at offset {offset}")]
    InvalidSize {
        kind: &'static str,
        size: usize,
        offset: usize,
    },

    /// Pointers chained into each other more deeply than any real file does.
    #[error("pointer chain deeper than {depth} at offset {offset}")]
    PointerDepth { depth: usize, offset: usize },

    /// Maps and arrays nested more deeply than any real record.
    #[error("container nesting deeper than {depth} at offset {offset}")]
    NestingDepth { depth: usize, offset: usize },

    /// A search tree record points into the 16-byte separator.
    #[error("search tree record {0} does not address the data section")]
    InvalidRecord(u32),
}

/// Failure while loading a database buffer.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("metadata marker not found")]
    MissingMarker,

    #[error("metadata is not a map")]
    InvalidMetadata,

    #[error("metadata field `{0}` is missing or has the wrong type")]
    MissingField(&'static str),

    #[error("unsupported record size {0}")]
    UnsupportedRecordSize(u64),

    #[error("unsupported ip version {0}")]
    UnsupportedIpVersion(u64),

    #[error("search tree of {tree} bytes does not fit before metadata at {marker}")]
    TruncatedTree { tree: usize, marker: usize },

    #[error("failed to decode metadata: {0}")]
    Decode(#[from] DecodeError),

    #[error("failed to read database file: {0}")]
    Io(#[from] std::io::Error),
}

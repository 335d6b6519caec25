//! Typed failures produced while ingesting or addressing records.
//!
//! Public entry points return `anyhow::Result`; the variants below are the
//! root causes carried inside those errors and inside [`LoadReport`]s, so
//! callers can `downcast_ref::<RecordError>()` when they need to branch.
//!
//! [`LoadReport`]: crate::LoadReport

use std::collections::TryReserveError;
use std::io;

/// Failure while reading, parsing or addressing a single record
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// The length header could not be read (truncated file or I/O error)
    #[error("failed to read record header at offset {offset}: {kind}")]
    HeaderRead { offset: u64, kind: io::ErrorKind },

    /// The length header was read but is not a valid `Size` message
    #[error("corrupt record header at offset {offset}")]
    HeaderParse { offset: u64 },

    /// The declared payload does not fit the scratch buffer
    #[error("record {ordinal} declares {size} bytes, exceeding the {max} byte limit")]
    PayloadTooLarge { ordinal: u32, size: u64, max: usize },

    /// The payload could not be read in full
    #[error("failed to read payload of record {ordinal}: {kind}")]
    PayloadRead { ordinal: u32, kind: io::ErrorKind },

    /// The payload is not a valid `Example` message
    #[error("failed to parse payload of record {ordinal}: {source}")]
    PayloadParse { ordinal: u32, source: prost::DecodeError },

    /// Kernel scratch space or a count buffer could not grow
    #[error("failed to allocate working memory: {0}")]
    Allocation(#[from] TryReserveError),

    /// The requested ordinal has not been ingested
    #[error("record {index} out of range ({available} records loaded)")]
    OutOfRange { index: u32, available: u32 },

    /// The file holds more records than an ordinal can address
    #[error("record file exceeds {limit} records")]
    TooManyRecords { limit: u32 },

    /// No record file is bound to the store
    #[error("no record file is open")]
    NotOpen,
}

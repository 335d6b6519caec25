//! On-disk record format.
//!
//! ```text
//! file    := record*
//! record  := header payload
//! header  := 0x09 ++ u64 (little-endian)     Size { fixed64 value = 1; }
//! payload := <value> bytes                  Example message
//! ```
//!
//! The header is itself a protobuf message whose only field is a `fixed64`,
//! so it always occupies [`HEADER_SIZE`] bytes once the field descriptor is
//! forced out (proto3 would omit a zero value, the writer never does).

use crate::error::RecordError;
use anyhow::{Context, Result};
use fs2::FileExt;
use prost::Message;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

/// Field descriptor of `Size.value`: field 1, wire type 1 (64-bit)
pub const SIZE_FIELD_DESCRIPTOR: u8 = 0x09;

/// Bytes taken by the length header (descriptor + fixed64)
pub const HEADER_SIZE: usize = 9;

/// Length header of a record
#[derive(Clone, PartialEq, Message)]
pub struct Size {
    /// Payload length in bytes
    #[prost(fixed64, tag = "1")]
    pub value: u64,
}

/// Detection results for one image
///
/// Detection `i` has class `classes[i]` and score `scores[i]`, both signed
/// bytes stored in `bytes` fields.
#[derive(Clone, PartialEq, Message)]
pub struct Example {
    /// Image file name, relative to the record file's directory
    #[prost(string, tag = "1")]
    pub filename: String,

    /// Number of detections the model reported
    #[prost(uint32, tag = "2")]
    pub num_detections: u32,

    /// One signed score per detection, 0..=100
    #[prost(bytes = "vec", tag = "3")]
    pub scores: Vec<u8>,

    /// One signed class id per detection
    #[prost(bytes = "vec", tag = "4")]
    pub classes: Vec<u8>,
}

impl Example {
    /// Builds an example from signed class ids and scores
    pub fn from_detections(filename: impl Into<String>, classes: &[i8], scores: &[i8]) -> Self {
        debug_assert_eq!(classes.len(), scores.len());
        Self {
            filename: filename.into(),
            num_detections: u32::try_from(classes.len()).unwrap_or(u32::MAX),
            scores: scores.iter().map(|&s| s as u8).collect(),
            classes: classes.iter().map(|&c| c as u8).collect(),
        }
    }
}

/// Encodes a length header
pub fn encode_header(payload_len: u64) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0] = SIZE_FIELD_DESCRIPTOR;
    header[1..].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Decodes a length header read at `offset`
///
/// # Errors
///
/// Returns [`RecordError::HeaderParse`] if the descriptor byte is wrong or the
/// bytes are not a valid `Size` message.
pub fn decode_header(header: &[u8; HEADER_SIZE], offset: u64) -> Result<u64, RecordError> {
    if header[0] != SIZE_FIELD_DESCRIPTOR {
        return Err(RecordError::HeaderParse { offset });
    }
    Size::decode(&header[..])
        .map(|size| size.value)
        .map_err(|_| RecordError::HeaderParse { offset })
}

/// Encodes one full record (header + payload)
pub fn encode_record(example: &Example) -> Vec<u8> {
    let payload = example.encode_to_vec();
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&encode_header(payload.len() as u64));
    out.extend_from_slice(&payload);
    out
}

/// Sequential writer of record files
///
/// Files created through [`RecordWriter::create`] hold an exclusive advisory
/// lock until the writer is dropped, so a store cannot open a half-written
/// file.
pub struct RecordWriter<W: Write> {
    inner: W,
    records: u64,
    bytes: u64,
}

impl RecordWriter<BufWriter<File>> {
    /// Creates (or truncates) a record file and locks it exclusively
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or is locked by another
    /// process.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create record file: {}", path.display()))?;
        FileExt::try_lock_exclusive(&file)
            .with_context(|| format!("Record file is locked: {}", path.display()))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> RecordWriter<W> {
    /// Wraps an arbitrary sink
    pub fn new(inner: W) -> Self {
        Self { inner, records: 0, bytes: 0 }
    }

    /// Appends one record and returns the byte offset it was written at
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying sink fails.
    pub fn append(&mut self, example: &Example) -> io::Result<u64> {
        let offset = self.bytes;
        let record = encode_record(example);
        self.inner.write_all(&record)?;
        self.records += 1;
        self.bytes += record.len() as u64;
        Ok(offset)
    }

    /// Number of records written
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Number of bytes written
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Flushes and returns the sink
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub fn finish(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Sequential reader yielding every record of a stream in order
///
/// Stops cleanly at end of stream; a truncated or corrupt record yields one
/// error and then ends the iteration.
pub struct RecordReader<R: Read> {
    inner: R,
    offset: u64,
    ordinal: u32,
    max_record_size: usize,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    /// Wraps a stream positioned at the first record
    pub fn new(inner: R, max_record_size: usize) -> Self {
        Self { inner, offset: 0, ordinal: 0, max_record_size, done: false }
    }

    /// Byte offset of the next record
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn next_record(&mut self) -> Result<Option<Example>, RecordError> {
        let mut header = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            match self.inner.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(RecordError::HeaderRead {
                        offset: self.offset,
                        kind: io::ErrorKind::UnexpectedEof,
                    });
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(RecordError::HeaderRead { offset: self.offset, kind: e.kind() }),
            }
        }

        let size = decode_header(&header, self.offset)?;
        let ordinal = self.ordinal;
        let len = usize::try_from(size)
            .ok()
            .filter(|&len| len <= self.max_record_size)
            .ok_or(RecordError::PayloadTooLarge { ordinal, size, max: self.max_record_size })?;

        let mut payload = vec![0u8; len];
        self.inner
            .read_exact(&mut payload)
            .map_err(|e| RecordError::PayloadRead { ordinal, kind: e.kind() })?;
        let example = Example::decode(payload.as_slice())
            .map_err(|source| RecordError::PayloadParse { ordinal, source })?;

        self.offset += (HEADER_SIZE + len) as u64;
        self.ordinal += 1;
        Ok(Some(example))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Example, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(example)) => Some(Ok(example)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

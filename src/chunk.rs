//! Chunk parsing for delivered stream segments.
//!
//! Brokers deliver messages in chunks, the unit of the underlying log:
//! a fixed header (type, counts, timestamp, epoch, first offset, CRC)
//! followed by a data section of entries. An entry is either a single
//! record or a sub-entry batch packing several records, flagged by the
//! high bit of its first byte.
//!
//! The frame decoder parses the header and verifies the CRC eagerly, so a
//! [`Chunk`] always holds a checksum-verified data section. Record
//! iteration is lazy; entry-level failures surface as [`ChunkError`] and
//! end iteration for that chunk without affecting the connection.

use bytes::{Buf, Bytes};
use thiserror::Error;

use crate::codec::{CodecError, FramingError, ProtocolError, wire};

/// Chunk magic (0x5) and version (0x0) packed into one byte.
const MAGIC_VERSION: u8 = 0x50;

/// High bit of an entry's first byte marks a sub-entry batch.
const ENTRY_BATCH_FLAG: u8 = 0x80;

/// Compression codec for records packed without compression.
const COMPRESSION_NONE: u8 = 0;

/// Role of a chunk within the stream log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChunkType {
    /// Messages published by clients.
    User,
    /// Offset-tracking delta written by the broker.
    TrackingDelta,
    /// Offset-tracking snapshot written by the broker.
    TrackingSnapshot,
}

impl ChunkType {
    fn from_wire(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::User),
            1 => Ok(Self::TrackingDelta),
            2 => Ok(Self::TrackingSnapshot),
            _ => Err(ProtocolError::UnknownChunkType { value }),
        }
    }

    /// Whether this chunk carries broker-internal tracking data rather
    /// than user messages.
    #[must_use]
    pub fn is_tracking(self) -> bool {
        matches!(self, Self::TrackingDelta | Self::TrackingSnapshot)
    }
}

/// A delivered chunk with a checksum-verified data section.
#[derive(Clone, Debug)]
pub struct Chunk {
    chunk_type: ChunkType,
    num_entries: u16,
    num_records: u32,
    timestamp: i64,
    epoch: u64,
    first_offset: u64,
    data: Bytes,
}

impl Chunk {
    /// Parse a chunk from a deliver frame payload, verifying the CRC.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] when the header is malformed, the data
    /// section is shorter than its declared length, or the CRC does not
    /// match. All of these are fatal to the connection: the broker and
    /// client no longer agree on the byte stream.
    pub(crate) fn parse(src: &mut Bytes) -> Result<Self, CodecError> {
        let magic = wire::get_u8(src, "chunk magic")?;
        if magic != MAGIC_VERSION {
            return Err(ProtocolError::ChunkMagicMismatch { found: magic }.into());
        }
        let chunk_type = ChunkType::from_wire(wire::get_u8(src, "chunk type")?)?;
        let num_entries = wire::get_u16(src, "chunk entry count")?;
        let num_records = wire::get_u32(src, "chunk record count")?;
        let timestamp = wire::get_i64(src, "chunk timestamp")?;
        let epoch = wire::get_u64(src, "chunk epoch")?;
        let first_offset = wire::get_u64(src, "chunk first offset")?;
        let expected = wire::get_u32(src, "chunk crc")?;
        let data_length = wire::len_to_usize(wire::get_u32(src, "chunk data length")?);
        let _trailer_length = wire::get_u32(src, "chunk trailer length")?;
        let _reserved = wire::get_u32(src, "chunk reserved")?;
        if src.remaining() < data_length {
            return Err(ProtocolError::Truncated {
                field: "chunk data",
            }
            .into());
        }
        let data = src.split_to(data_length);
        let actual = crc32fast::hash(&data);
        if actual != expected {
            return Err(FramingError::ChecksumMismatch { expected, actual }.into());
        }
        Ok(Self {
            chunk_type,
            num_entries,
            num_records,
            timestamp,
            epoch,
            first_offset,
            data,
        })
    }

    /// Role of this chunk within the log.
    #[must_use]
    pub fn chunk_type(&self) -> ChunkType { self.chunk_type }

    /// Number of entries in the data section. Sub-entry batches count as
    /// one entry regardless of how many records they pack.
    #[must_use]
    pub fn num_entries(&self) -> u16 { self.num_entries }

    /// Total number of records, counting through sub-entry batches.
    #[must_use]
    pub fn num_records(&self) -> u32 { self.num_records }

    /// Broker write timestamp, milliseconds since the UNIX epoch.
    #[must_use]
    pub fn timestamp(&self) -> i64 { self.timestamp }

    /// Leader epoch under which the chunk was written.
    #[must_use]
    pub fn epoch(&self) -> u64 { self.epoch }

    /// Offset of the first record in this chunk.
    #[must_use]
    pub fn first_offset(&self) -> u64 { self.first_offset }

    /// Iterate the raw record payloads in log order.
    ///
    /// Record `i` has offset `first_offset() + i`. The first failure ends
    /// iteration: records after a malformed entry cannot be assigned
    /// offsets reliably.
    #[must_use]
    pub fn records(&self) -> Records {
        Records {
            data: self.data.clone(),
            entries_left: self.num_entries,
            batch: None,
            failed: false,
        }
    }
}

/// Iterator over the record payloads of one chunk.
pub struct Records {
    data: Bytes,
    entries_left: u16,
    batch: Option<Batch>,
    failed: bool,
}

struct Batch {
    data: Bytes,
    records_left: u16,
}

impl Records {
    fn begin_batch(&mut self) -> Result<(), ChunkError> {
        let header = wire::get_u8(&mut self.data, "sub-entry header")?;
        let compression = (header >> 4) & 0x07;
        let records_left = wire::get_u16(&mut self.data, "sub-entry record count")?;
        let _uncompressed = wire::get_u32(&mut self.data, "sub-entry uncompressed size")?;
        let compressed = wire::len_to_usize(wire::get_u32(&mut self.data, "sub-entry size")?);
        if self.data.remaining() < compressed {
            return Err(ProtocolError::Truncated {
                field: "sub-entry batch",
            }
            .into());
        }
        let data = self.data.split_to(compressed);
        if compression != COMPRESSION_NONE {
            return Err(ChunkError::UnsupportedCompression { code: compression });
        }
        self.batch = Some(Batch { data, records_left });
        Ok(())
    }

    fn next_inner(&mut self) -> Option<Result<Bytes, ChunkError>> {
        loop {
            if let Some(batch) = self.batch.as_mut() {
                if batch.records_left == 0 {
                    self.batch = None;
                    continue;
                }
                batch.records_left -= 1;
                return Some(read_record(&mut batch.data).map_err(ChunkError::from));
            }
            if self.entries_left == 0 {
                return None;
            }
            self.entries_left -= 1;
            let Some(&first) = self.data.first() else {
                return Some(Err(ProtocolError::Truncated {
                    field: "chunk entry",
                }
                .into()));
            };
            if first & ENTRY_BATCH_FLAG == 0 {
                return Some(read_record(&mut self.data).map_err(ChunkError::from));
            }
            if let Err(e) = self.begin_batch() {
                return Some(Err(e));
            }
        }
    }
}

impl Iterator for Records {
    type Item = Result<Bytes, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.next_inner();
        if matches!(item, Some(Err(_))) {
            self.failed = true;
        }
        item
    }
}

fn read_record(data: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = wire::len_to_usize(wire::get_u32(data, "record length")?);
    if data.remaining() < len {
        return Err(ProtocolError::Truncated { field: "record" });
    }
    Ok(data.split_to(len))
}

/// Failure expanding a chunk's data section into records.
///
/// These are per-chunk conditions: the chunk's CRC already verified the
/// bytes arrived intact, so a malformed entry means the broker wrote
/// something this client cannot interpret. The consumer reports the error
/// for the affected chunk and continues with the next one.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChunkError {
    /// An entry or record was malformed.
    #[error("malformed chunk entry: {0}")]
    Entry(#[from] ProtocolError),

    /// A sub-entry batch uses a compression codec this client does not
    /// decode.
    #[error("sub-entry batch uses unsupported compression codec {code}")]
    UnsupportedCompression {
        /// Compression code from the sub-entry header.
        code: u8,
    },
}

//! Fabricates osiris chunks for scripted deliveries.

use bytes::{BufMut, Bytes, BytesMut};

const MAGIC_VERSION: u8 = 0x50;
const ENTRY_BATCH_FLAG: u8 = 0x80;

/// Wrap a payload in the client's message envelope: a zero flags byte
/// (no properties) followed by the length-prefixed payload.
pub fn message_entry(payload: impl AsRef<[u8]>) -> Bytes {
    let payload = payload.as_ref();
    let mut entry = BytesMut::with_capacity(payload.len() + 5);
    entry.put_u8(0);
    entry.put_i32(i32::try_from(payload.len()).expect("payload fits i32"));
    entry.put_slice(payload);
    entry.freeze()
}

enum Entry {
    Plain(Bytes),
    Batch(Vec<Bytes>),
}

/// Builds the byte form of one chunk, CRC included.
///
/// ```rust
/// use streamwire_testing::ChunkBuilder;
///
/// let chunk = ChunkBuilder::new(42).message("a").message("b").build();
/// assert_eq!(chunk[0], 0x50);
/// ```
pub struct ChunkBuilder {
    chunk_type: u8,
    first_offset: u64,
    epoch: u64,
    timestamp: i64,
    entries: Vec<Entry>,
}

impl ChunkBuilder {
    /// Start a user chunk whose first record sits at `first_offset`.
    pub fn new(first_offset: u64) -> Self {
        Self {
            chunk_type: 0,
            first_offset,
            epoch: 1,
            timestamp: 1_700_000_000_000,
            entries: Vec::new(),
        }
    }

    /// Override the chunk type; non-zero types are broker tracking chunks.
    pub fn chunk_type(mut self, chunk_type: u8) -> Self {
        self.chunk_type = chunk_type;
        self
    }

    /// Override the writer epoch.
    pub fn epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    /// Override the broker write timestamp (milliseconds).
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Append one message record, wrapped in the standard envelope.
    pub fn message(self, payload: impl AsRef<[u8]>) -> Self {
        self.raw_entry(message_entry(payload))
    }

    /// Append one record with caller-provided entry bytes, for scripting
    /// envelopes the client should reject.
    pub fn raw_entry(mut self, entry: Bytes) -> Self {
        self.entries.push(Entry::Plain(entry));
        self
    }

    /// Append an uncompressed sub-entry batch of message records.
    pub fn batch(mut self, payloads: &[&[u8]]) -> Self {
        let records = payloads.iter().map(message_entry).collect();
        self.entries.push(Entry::Batch(records));
        self
    }

    /// Encode the chunk: header, CRC over the data section, data.
    pub fn build(self) -> Bytes {
        let mut data = BytesMut::new();
        let mut num_records: u32 = 0;
        for entry in &self.entries {
            match entry {
                Entry::Plain(record) => {
                    num_records += 1;
                    put_record(&mut data, record);
                }
                Entry::Batch(records) => {
                    num_records += u32::try_from(records.len()).expect("batch fits u32");
                    let mut packed = BytesMut::new();
                    for record in records {
                        put_record(&mut packed, record);
                    }
                    data.put_u8(ENTRY_BATCH_FLAG);
                    data.put_u16(u16::try_from(records.len()).expect("batch fits u16"));
                    let packed_len = u32::try_from(packed.len()).expect("batch data fits u32");
                    data.put_u32(packed_len);
                    data.put_u32(packed_len);
                    data.extend_from_slice(&packed);
                }
            }
        }
        let mut buf = BytesMut::with_capacity(data.len() + 48);
        buf.put_u8(MAGIC_VERSION);
        buf.put_u8(self.chunk_type);
        buf.put_u16(u16::try_from(self.entries.len()).expect("entries fit u16"));
        buf.put_u32(num_records);
        buf.put_i64(self.timestamp);
        buf.put_u64(self.epoch);
        buf.put_u64(self.first_offset);
        buf.put_u32(crc32fast::hash(&data));
        buf.put_u32(u32::try_from(data.len()).expect("data fits u32"));
        buf.put_u32(0);
        buf.put_u32(0);
        buf.extend_from_slice(&data);
        buf.freeze()
    }
}

fn put_record(dst: &mut BytesMut, record: &Bytes) {
    dst.put_u32(u32::try_from(record.len()).expect("record fits u32"));
    dst.put_slice(record);
}

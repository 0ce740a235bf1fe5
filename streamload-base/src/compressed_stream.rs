// Chunked Compressed Stream
//
// [4] tag (PACKAGE_FILE_TAG) encoded as u32
// [4] chunk size: the most uncompressed bytes any data chunk holds. Streams written before this
//     field existed store the tag here instead, meaning DEFAULT_COMPRESSION_CHUNK_SIZE.
// [8*n] chunk table of n = ceil(total_uncompressed / chunk_size) + 1 entries, each
//     [u32 compressed size][u32 uncompressed size]. Entry 0 is not a data chunk: it holds the
//     total compressed payload and the total uncompressed size of the whole stream.
// [x] compressed bytes of data chunks 1..n, back to back, each independently decompressible
//
// Values are written with the writer's native byte order. A reader that finds
// PACKAGE_FILE_TAG_SWAPPED in the tag field swaps every following u32.
//
// Every data chunk holds exactly chunk_size uncompressed bytes except the last, which may be
// shorter.

use crate::byte_cursor::{ByteCursor, ByteWriter};
use crate::FormatError;

pub const PACKAGE_FILE_TAG: u32 = 0x9E2A83C1;
pub const PACKAGE_FILE_TAG_SWAPPED: u32 = 0xC1832A9E;
pub const DEFAULT_COMPRESSION_CHUNK_SIZE: u32 = 131072;

pub const STREAM_HEADER_SIZE: usize = 8;
pub const CHUNK_INFO_SIZE: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct ChunkInfo {
    pub compressed_size: u32,
    pub uncompressed_size: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StreamHeader {
    pub byte_swapped: bool,
    pub chunk_size: u32,
}

impl StreamHeader {
    /// Parses the two-word header at the start of a compressed stream. A tag matching neither the
    /// expected nor the byte-swapped constant fails with `BadTag`.
    pub fn parse(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut cursor = ByteCursor::new(bytes, false);
        let tag = cursor.read_u32()?;
        let raw_chunk_size = cursor.read_u32()?;

        let byte_swapped = match tag {
            PACKAGE_FILE_TAG => false,
            PACKAGE_FILE_TAG_SWAPPED => true,
            actual => {
                return Err(FormatError::BadTag {
                    expected: PACKAGE_FILE_TAG,
                    actual,
                })
            }
        };

        let mut chunk_size = if byte_swapped {
            raw_chunk_size.swap_bytes()
        } else {
            raw_chunk_size
        };

        if chunk_size == PACKAGE_FILE_TAG {
            chunk_size = DEFAULT_COMPRESSION_CHUNK_SIZE;
        }

        if chunk_size == 0 {
            return Err(FormatError::InvalidChunkTable("chunk size is zero".to_string()));
        }

        Ok(StreamHeader {
            byte_swapped,
            chunk_size,
        })
    }

    /// Number of chunk table entries needed for a stream of the given size, including entry 0
    pub fn table_entry_count(
        &self,
        uncompressed_size: u64,
    ) -> usize {
        let chunk_size = self.chunk_size as u64;
        ((uncompressed_size + chunk_size - 1) / chunk_size) as usize + 1
    }

    pub fn table_size_in_bytes(
        &self,
        uncompressed_size: u64,
    ) -> usize {
        self.table_entry_count(uncompressed_size) * CHUNK_INFO_SIZE
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkTable {
    pub chunk_size: u32,
    pub summary: ChunkInfo,
    pub chunks: Vec<ChunkInfo>,
}

impl ChunkTable {
    /// Parses `entry_count` table entries (entry 0 included) from `bytes`
    pub fn parse(
        header: &StreamHeader,
        entry_count: usize,
        bytes: &[u8],
    ) -> Result<Self, FormatError> {
        if entry_count == 0 {
            return Err(FormatError::InvalidChunkTable(
                "table has no summary entry".to_string(),
            ));
        }

        let mut cursor = ByteCursor::new(bytes, header.byte_swapped);
        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let compressed_size = cursor.read_u32()?;
            let uncompressed_size = cursor.read_u32()?;
            entries.push(ChunkInfo {
                compressed_size,
                uncompressed_size,
            });
        }

        let summary = entries.remove(0);
        Ok(ChunkTable {
            chunk_size: header.chunk_size,
            summary,
            chunks: entries,
        })
    }

    /// Sum of the data chunks' uncompressed sizes
    pub fn computed_uncompressed_size(&self) -> u64 {
        self.chunks
            .iter()
            .map(|x| x.uncompressed_size as u64)
            .sum()
    }

    /// Sum of the data chunks' compressed sizes
    pub fn computed_compressed_size(&self) -> u64 {
        self.chunks.iter().map(|x| x.compressed_size as u64).sum()
    }

    pub fn max_compressed_chunk_size(&self) -> usize {
        self.chunks
            .iter()
            .map(|x| x.compressed_size as usize)
            .max()
            .unwrap_or(0)
    }

    /// Checks that no chunk exceeds the chunk size and only the last one is short
    pub fn validate_chunk_sizes(&self) -> Result<(), FormatError> {
        let chunk_count = self.chunks.len();
        for (index, chunk) in self.chunks.iter().enumerate() {
            if chunk.uncompressed_size > self.chunk_size {
                return Err(FormatError::InvalidChunkTable(format!(
                    "chunk {} holds {} bytes, more than the chunk size {}",
                    index + 1,
                    chunk.uncompressed_size,
                    self.chunk_size
                )));
            }

            if index + 1 < chunk_count && chunk.uncompressed_size != self.chunk_size {
                return Err(FormatError::InvalidChunkTable(format!(
                    "chunk {} holds {} bytes but only the last chunk may be shorter than {}",
                    index + 1,
                    chunk.uncompressed_size,
                    self.chunk_size
                )));
            }
        }

        Ok(())
    }
}

/// Produces a chunked compressed stream. The compression itself is supplied by the caller so this
/// crate stays free of codec dependencies.
pub struct CompressedStreamWriter {
    chunk_size: u32,
    byte_swapped: bool,
    legacy_chunk_size: bool,
}

impl CompressedStreamWriter {
    pub fn new(chunk_size: u32) -> Self {
        assert!(chunk_size > 0);
        CompressedStreamWriter {
            chunk_size,
            byte_swapped: false,
            legacy_chunk_size: false,
        }
    }

    /// Write as if produced on a machine with the other byte order
    pub fn with_byte_swapped(
        mut self,
        byte_swapped: bool,
    ) -> Self {
        self.byte_swapped = byte_swapped;
        self
    }

    /// Store the tag in the chunk size field, as streams predating the field did. Only valid with
    /// DEFAULT_COMPRESSION_CHUNK_SIZE.
    pub fn with_legacy_chunk_size(
        mut self,
        legacy_chunk_size: bool,
    ) -> Self {
        assert!(!legacy_chunk_size || self.chunk_size == DEFAULT_COMPRESSION_CHUNK_SIZE);
        self.legacy_chunk_size = legacy_chunk_size;
        self
    }

    pub fn write<F: FnMut(&[u8]) -> Vec<u8>>(
        &self,
        data: &[u8],
        mut compress: F,
    ) -> Vec<u8> {
        let compressed_chunks: Vec<(usize, Vec<u8>)> = data
            .chunks(self.chunk_size as usize)
            .map(|chunk| (chunk.len(), compress(chunk)))
            .collect();

        let total_compressed: usize = compressed_chunks.iter().map(|(_, c)| c.len()).sum();

        let mut writer = ByteWriter::new(self.byte_swapped);
        writer.write_u32(PACKAGE_FILE_TAG);
        if self.legacy_chunk_size {
            writer.write_u32(PACKAGE_FILE_TAG);
        } else {
            writer.write_u32(self.chunk_size);
        }

        writer.write_u32(total_compressed as u32);
        writer.write_u32(data.len() as u32);
        for (uncompressed_size, compressed) in &compressed_chunks {
            writer.write_u32(compressed.len() as u32);
            writer.write_u32(*uncompressed_size as u32);
        }

        for (_, compressed) in &compressed_chunks {
            writer.write_bytes(compressed);
        }

        writer.into_inner()
    }
}

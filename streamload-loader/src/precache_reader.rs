use crate::async_io::{AsyncIoService, CompletionCounter, IoBuffer};
use crate::clock::Poller;
use crate::config::ReaderConfig;
use crate::{LoaderError, LoaderResult};
use std::sync::Arc;
use std::time::Duration;
use streamload_base::{CompressionMethod, PackageChunk};

// One of the two read-ahead buffers. The range is logical (uncompressed) offsets.
#[derive(Default)]
struct PrecacheSlot {
    start: u64,
    end: u64,
    buffer: Option<IoBuffer>,
    pending: CompletionCounter,
}

impl PrecacheSlot {
    fn contains(
        &self,
        start: u64,
        end: u64,
    ) -> bool {
        self.buffer.is_some() && start >= self.start && end <= self.end
    }

    fn release(&mut self) {
        debug_assert!(self.pending.is_complete());
        self.buffer = None;
        self.start = 0;
        self.end = 0;
    }
}

/// Read-ahead reader over one file. Deserialization code calls `read`, which only blocks when the
/// bytes it needs were not prefetched with `precache`.
///
/// Two buffers rotate between the "current" and "next" roles. In compressed mode, "next" holds
/// the chunk after the one being read so sequential reads find it already decompressed.
pub struct PrecachingReader {
    io: Arc<AsyncIoService>,
    file_name: String,
    file_size: u64,
    uncompressed_size: u64,
    position: u64,
    slots: [PrecacheSlot; 2],
    current: usize,
    compressed_chunks: Vec<PackageChunk>,
    compression: CompressionMethod,
    current_chunk_index: usize,
    has_error: bool,
    config: ReaderConfig,
    poller: Poller,
    blocked_time: Duration,
}

impl PrecachingReader {
    pub fn new(
        io: Arc<AsyncIoService>,
        file_name: &str,
        config: &ReaderConfig,
    ) -> Self {
        let (file_size, has_error) = match io.backend().file_size(file_name) {
            Ok(size) => (size, false),
            Err(e) => {
                log::warn!("Could not open {} for precached reading: {}", file_name, e);
                (0, true)
            }
        };

        let poller = io.poller().clone();
        PrecachingReader {
            io,
            file_name: file_name.to_string(),
            file_size,
            uncompressed_size: file_size,
            position: 0,
            slots: Default::default(),
            current: 0,
            compressed_chunks: Vec::default(),
            compression: CompressionMethod::None,
            current_chunk_index: 0,
            has_error,
            config: config.clone(),
            poller,
            blocked_time: Duration::ZERO,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Logical size: the decompressed size once a compression map is set
    pub fn total_size(&self) -> u64 {
        self.uncompressed_size
    }

    pub fn is_compressed(&self) -> bool {
        !self.compressed_chunks.is_empty()
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    /// Total time `read` spent waiting for data that wasn't precached
    pub fn blocked_time(&self) -> Duration {
        self.blocked_time
    }

    pub fn tell(&self) -> u64 {
        self.position
    }

    pub fn seek(
        &mut self,
        position: i64,
    ) -> LoaderResult<()> {
        if position < 0 || position as u64 > self.total_size() {
            return Err(LoaderError::OutOfRange {
                position,
                size: self.total_size(),
            });
        }
        self.position = position as u64;
        Ok(())
    }

    fn next(&self) -> usize {
        1 - self.current
    }

    /// Index of the compressed chunk holding the logical offset, searching from the last one used
    pub fn find_compressed_chunk_index(
        &mut self,
        offset: u64,
    ) -> LoaderResult<usize> {
        let start = self.current_chunk_index.min(self.compressed_chunks.len());
        let found = (start..self.compressed_chunks.len())
            .chain(0..start)
            .find(|&index| self.compressed_chunks[index].contains(offset));

        match found {
            Some(index) => {
                self.current_chunk_index = index;
                Ok(index)
            }
            None => Err(LoaderError::OutOfRange {
                position: offset as i64,
                size: self.total_size(),
            }),
        }
    }

    // A compressed-mode range can only be resident if it lies inside a single chunk, so ranges
    // are clamped to the end of the chunk they start in.
    fn clamp_to_chunk(
        &mut self,
        offset: u64,
        end: u64,
    ) -> LoaderResult<(usize, u64)> {
        let chunk_index = self.find_compressed_chunk_index(offset)?;
        let chunk_end = self.compressed_chunks[chunk_index].uncompressed_end();
        Ok((chunk_index, end.min(chunk_end)))
    }

    fn check_buffer_error(
        &mut self,
        slot: usize,
    ) -> LoaderResult<()> {
        if let Some(error) = self.slots[slot].buffer.as_ref().and_then(|x| x.error()) {
            self.has_error = true;
            return Err(error);
        }
        Ok(())
    }

    /// Returns true once `[offset, offset + size)` is resident and finished loading. Otherwise
    /// starts whatever IO is needed and returns false. Never blocks.
    ///
    /// In compressed mode only the part of the range inside the chunk holding `offset` is
    /// considered.
    pub fn precache(
        &mut self,
        offset: u64,
        size: u64,
    ) -> LoaderResult<bool> {
        let end = offset + size;
        if end > self.total_size() {
            return Err(LoaderError::SeekPastEnd {
                position: offset,
                count: size,
                size: self.total_size(),
            });
        }

        if size == 0 {
            return Ok(true);
        }

        let compressed = self.is_compressed();
        let (chunk_index, end) = if compressed {
            self.clamp_to_chunk(offset, end)?
        } else {
            (0, end)
        };

        let current = self.current;
        if self.slots[current].contains(offset, end) {
            let complete = self.slots[current].pending.is_complete();
            if complete {
                self.check_buffer_error(current)?;
            }
            return Ok(complete);
        }

        // Still waiting on a read for one of the slots, don't start another
        if !self.slots[current].pending.is_complete() {
            return Ok(false);
        }
        if !self.slots[self.next()].pending.is_complete() {
            return Ok(false);
        }

        if compressed {
            self.buffer_switcheroo();
            let current = self.current;
            if !self.slots[current].contains(offset, end) {
                self.precache_compressed_chunk(chunk_index, current)?;
            }

            if chunk_index + 1 < self.compressed_chunks.len() {
                let next = self.next();
                self.precache_compressed_chunk(chunk_index + 1, next)?;
            }
        } else {
            let read_size = size
                .max(self.config.min_precache_block_size)
                .min(self.file_size - offset);
            let slot = &mut self.slots[current];
            slot.release();
            let buffer = IoBuffer::with_len(read_size as usize);
            slot.start = offset;
            slot.end = offset + read_size;
            slot.buffer = Some(buffer.clone());
            self.io.load_data(
                &self.file_name,
                offset as i64,
                read_size,
                buffer,
                Some(slot.pending.clone()),
                self.config.precache_priority,
            )?;
        }

        Ok(false)
    }

    // The prefetched "next" buffer becomes current, the old current buffer is released
    fn buffer_switcheroo(&mut self) {
        self.slots[self.current].release();
        self.current = self.next();
    }

    fn precache_compressed_chunk(
        &mut self,
        chunk_index: usize,
        slot_index: usize,
    ) -> LoaderResult<()> {
        let chunk = self.compressed_chunks[chunk_index];
        let slot = &mut self.slots[slot_index];
        slot.release();

        let buffer = IoBuffer::with_len(chunk.uncompressed_size as usize);
        slot.start = chunk.uncompressed_offset as u64;
        slot.end = chunk.uncompressed_end();
        slot.buffer = Some(buffer.clone());
        self.io.load_compressed_data(
            &self.file_name,
            chunk.compressed_offset as i64,
            chunk.compressed_size as u64,
            chunk.uncompressed_size as u64,
            self.compression,
            buffer,
            Some(slot.pending.clone()),
            self.config.precache_priority,
        )?;
        Ok(())
    }

    /// Copies `dest.len()` bytes at the cursor into `dest` and advances the cursor, polling until
    /// the bytes are resident if they were not precached.
    pub fn read(
        &mut self,
        dest: &mut [u8],
    ) -> LoaderResult<()> {
        let count = dest.len() as u64;
        if self.position + count > self.total_size() {
            return Err(LoaderError::SeekPastEnd {
                position: self.position,
                count,
                size: self.total_size(),
            });
        }

        let poller = self.poller.clone();
        let mut written = 0;
        while written < dest.len() {
            let offset = self.position;
            let remaining = (dest.len() - written) as u64;
            let piece = if self.is_compressed() {
                let (_, end) = self.clamp_to_chunk(offset, offset + remaining)?;
                end - offset
            } else {
                remaining
            };

            let slept = poller.try_poll_until(|| self.precache(offset, piece))?;
            self.blocked_time += slept;

            let slot = &self.slots[self.current];
            debug_assert!(slot.pending.is_complete());
            debug_assert!(slot.contains(offset, offset + piece));
            let buffer = slot
                .buffer
                .as_ref()
                .ok_or_else(|| LoaderError::from("precached slot has no buffer"))?;
            let data = buffer.data();
            let begin = (offset - slot.start) as usize;
            let piece = piece as usize;
            dest[written..written + piece].copy_from_slice(&data[begin..begin + piece]);

            written += piece;
            self.position += piece as u64;
        }

        Ok(())
    }

    /// Switches to reading through the compressed chunk map. Offsets passed to `precache` and
    /// `read` become logical offsets.
    pub fn set_compression_map(
        &mut self,
        compressed_chunks: Vec<PackageChunk>,
        compression: CompressionMethod,
    ) {
        self.current_chunk_index = 0;
        self.flush_cache();
        if let Some(last) = compressed_chunks.last() {
            self.uncompressed_size = last.uncompressed_end();
        }
        self.compressed_chunks = compressed_chunks;
        self.compression = compression;
    }

    /// Waits for reads in flight, then releases both buffers
    pub fn flush_cache(&mut self) {
        let slots = &self.slots;
        self.blocked_time += self
            .poller
            .poll_until(|| slots.iter().all(|x| x.pending.is_complete()));
        for slot in &mut self.slots {
            slot.release();
        }
    }

    /// Returns false if the file could not be opened or a read failed
    pub fn close(&mut self) -> bool {
        self.flush_cache();
        !self.has_error
    }
}

impl Drop for PrecachingReader {
    fn drop(&mut self) {
        self.flush_cache();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::async_io::IoServiceOptions;
    use crate::decompress::compress_block;
    use crate::platform_io::MemoryIoBackend;
    use streamload_base::CompressedStreamWriter;

    fn sample_data(len: usize) -> Vec<u8> {
        (0..len).map(|x| ((x * 31 + x / 7) % 256) as u8).collect()
    }

    fn create_io(backend: &Arc<MemoryIoBackend>) -> Arc<AsyncIoService> {
        let _ = env_logger::builder().is_test(true).try_init();
        Arc::new(AsyncIoService::new(backend.clone(), IoServiceOptions::default()).unwrap())
    }

    fn reader_config(min_precache_block_size: u64) -> ReaderConfig {
        ReaderConfig {
            min_precache_block_size,
            ..Default::default()
        }
    }

    // Logical data starting at logical offset `base`, stored as one compressed stream per block
    fn compressed_file(
        data: &[u8],
        base: u32,
        block_size: usize,
    ) -> (Vec<u8>, Vec<PackageChunk>) {
        let mut file = vec![0u8; 32];
        let mut chunks = Vec::default();
        for (index, block) in data.chunks(block_size).enumerate() {
            let stream = CompressedStreamWriter::new(256)
                .write(block, |x| compress_block(CompressionMethod::Zlib, x).unwrap());
            chunks.push(PackageChunk {
                uncompressed_offset: base + (index * block_size) as u32,
                uncompressed_size: block.len() as u32,
                compressed_offset: file.len() as u32,
                compressed_size: stream.len() as u32,
            });
            file.extend_from_slice(&stream);
        }
        (file, chunks)
    }

    #[test]
    fn small_reads_share_one_block() {
        let backend = Arc::new(MemoryIoBackend::new());
        let data = sample_data(10_000);
        backend.add_file("plain", data.clone());
        let io = create_io(&backend);
        let mut reader = PrecachingReader::new(io, "plain", &reader_config(4096));

        let mut value = [0u8; 4];
        reader.read(&mut value).unwrap();
        assert_eq!(&value[..], &data[0..4]);
        reader.read(&mut value).unwrap();
        assert_eq!(&value[..], &data[4..8]);
        assert_eq!(reader.tell(), 8);

        let log = backend.read_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].length, 4096);
        assert!(reader.close());
    }

    #[test]
    fn precache_is_polled_until_ready() {
        let backend = Arc::new(MemoryIoBackend::new());
        backend.add_file("plain", sample_data(100));
        let io = create_io(&backend);
        let mut reader = PrecachingReader::new(io.clone(), "plain", &reader_config(4096));

        backend.pause_reads();
        assert!(!reader.precache(10, 20).unwrap());
        assert!(!reader.precache(10, 20).unwrap());
        backend.resume_reads();
        io.block_until_all_requests_finished();
        assert!(reader.precache(10, 20).unwrap());
        // Clipped to the end of the file
        assert_eq!(backend.read_log()[0].length, 90);
        assert_eq!(reader.tell(), 0);
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let backend = Arc::new(MemoryIoBackend::new());
        backend.add_file("plain", sample_data(100));
        let io = create_io(&backend);
        let mut reader = PrecachingReader::new(io, "plain", &reader_config(4096));

        assert!(matches!(reader.seek(-1), Err(LoaderError::OutOfRange { .. })));
        assert!(matches!(reader.seek(101), Err(LoaderError::OutOfRange { .. })));
        reader.seek(100).unwrap();

        reader.seek(96).unwrap();
        let mut dest = [0u8; 8];
        assert!(matches!(reader.read(&mut dest), Err(LoaderError::SeekPastEnd { .. })));
        assert_eq!(reader.tell(), 96);
    }

    #[test]
    fn missing_file_is_sticky_error() {
        let backend = Arc::new(MemoryIoBackend::new());
        let io = create_io(&backend);
        let mut reader = PrecachingReader::new(io, "missing", &reader_config(4096));
        assert!(reader.has_error());
        assert_eq!(reader.total_size(), 0);
        assert!(!reader.close());
    }

    #[test]
    fn compressed_reads_cross_chunks() {
        let backend = Arc::new(MemoryIoBackend::new());
        let data = sample_data(5000);
        let (file, chunks) = compressed_file(&data, 100, 1024);
        backend.add_file("packed", file);
        let io = create_io(&backend);
        let mut reader = PrecachingReader::new(io, "packed", &reader_config(4096));
        reader.set_compression_map(chunks, CompressionMethod::Zlib);
        assert!(reader.is_compressed());
        assert_eq!(reader.total_size(), 5100);

        // Spans the first two chunks
        reader.seek(1000).unwrap();
        let mut dest = vec![0u8; 300];
        reader.read(&mut dest).unwrap();
        assert_eq!(&dest[..], &data[900..1200]);

        // Everything at once
        reader.seek(100).unwrap();
        let mut all = vec![0u8; 5000];
        reader.read(&mut all).unwrap();
        assert!(all == data);
        assert_eq!(reader.find_compressed_chunk_index(5099).unwrap(), 4);
        assert!(reader.find_compressed_chunk_index(50).is_err());
        assert!(reader.close());
    }

    #[test]
    fn next_chunk_is_prefetched() {
        let backend = Arc::new(MemoryIoBackend::new());
        let data = sample_data(4096);
        let (file, chunks) = compressed_file(&data, 0, 1024);
        let chunk_offsets: Vec<u64> = chunks.iter().map(|x| x.compressed_offset as u64).collect();
        backend.add_file("packed", file);
        let io = create_io(&backend);
        let mut reader = PrecachingReader::new(io.clone(), "packed", &reader_config(4096));
        reader.set_compression_map(chunks, CompressionMethod::Zlib);

        assert!(!reader.precache(0, 16).unwrap());
        io.block_until_all_requests_finished();
        assert!(reader.precache(0, 16).unwrap());

        // Both the chunk holding offset 0 and the one after it were requested
        let headers: Vec<u64> = backend
            .read_log()
            .iter()
            .filter(|x| x.length == 8 && chunk_offsets.contains(&x.offset))
            .map(|x| x.offset)
            .collect();
        assert_eq!(headers, vec![chunk_offsets[0], chunk_offsets[1]]);

        // Moving into chunk 1 swaps the prefetched buffer in without reading it again
        assert!(!reader.precache(1024, 16).unwrap());
        io.block_until_all_requests_finished();
        assert!(reader.precache(1024, 16).unwrap());
        let header_reads = backend
            .read_log()
            .iter()
            .filter(|x| x.length == 8 && chunk_offsets.contains(&x.offset))
            .count();
        assert_eq!(header_reads, 3);
    }

    #[test]
    fn reads_never_observe_partial_buffers() {
        let backend = Arc::new(MemoryIoBackend::new());
        backend.set_read_latency(Duration::from_millis(1));
        let data = sample_data(6000);
        let (file, chunks) = compressed_file(&data, 0, 700);
        backend.add_file("packed", file);
        backend.add_file("plain", data.clone());
        let io = create_io(&backend);

        let mut plain = PrecachingReader::new(io.clone(), "plain", &reader_config(512));
        let mut packed = PrecachingReader::new(io, "packed", &reader_config(512));
        packed.set_compression_map(chunks, CompressionMethod::Zlib);

        let accesses = [(0, 10), (5, 900), (4000, 1), (3990, 2000), (1, 1), (2500, 777), (0, 6000)];
        for reader in [&mut plain, &mut packed] {
            for &(offset, size) in &accesses {
                // Kick off the read and let the caller race it
                let _ = reader.precache(offset as u64, size as u64).unwrap();
                reader.seek(offset).unwrap();
                let mut dest = vec![0u8; size];
                reader.read(&mut dest).unwrap();
                assert!(dest[..] == data[offset as usize..offset as usize + size]);
            }
            assert!(reader.close());
        }
    }
}

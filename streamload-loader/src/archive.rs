use crate::disk_io::{AsyncReadQueue, ReadEncoding, ReadRequest, ReadSlot};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CURRENT: usize = 0;
const NEXT: usize = 1;

/// One entry of a chunk index. Offsets in uncompressed space are what the archive's users seek
/// to, compressed offsets are positions in the file.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedChunk {
    pub uncompressed_offset: u64,
    pub uncompressed_size: u64,
    pub compressed_offset: u64,
    pub compressed_size: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionFlags {
    /// Chunks are stored as-is
    None,
    Zlib,
}

struct CompressionMap {
    chunks: Vec<CompressedChunk>,
    flags: CompressionFlags,
    // File offset just past the last compressed chunk, where the bulk data area begins
    compressed_end: u64,
}

impl CompressionMap {
    fn find_chunk_index(
        &self,
        offset: u64,
    ) -> usize {
        let index = self
            .chunks
            .partition_point(|chunk| chunk.uncompressed_offset + chunk.uncompressed_size <= offset);
        assert!(
            index < self.chunks.len(),
            "offset {} is not covered by any compressed chunk",
            offset
        );
        index
    }
}

// A logical byte range [start, end) and the read that fills it
#[derive(Default)]
struct PrecacheBuffer {
    start: u64,
    end: u64,
    read: Option<Arc<ReadSlot>>,
    data: Vec<u8>,
}

impl PrecacheBuffer {
    fn is_finished(&self) -> bool {
        self.read.as_ref().map_or(true, |read| read.is_finished())
    }

    fn contains(
        &self,
        offset: u64,
        size: u64,
    ) -> bool {
        offset >= self.start && offset + size <= self.end
    }

    // Moves the bytes of a finished read into the buffer. A failed read empties the range so the
    // next precache issues it again.
    fn resolve(&mut self) -> std::io::Result<()> {
        if let Some(read) = &self.read {
            if let Some(result) = read.take_result() {
                self.read = None;
                match result {
                    Ok(data) => {
                        debug_assert_eq!(data.len() as u64, self.end - self.start);
                        self.data = data;
                    }
                    Err(e) => {
                        self.reset();
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        debug_assert!(self.is_finished());
        *self = PrecacheBuffer::default();
    }
}

/// Sequential reader over one file that keeps two precache buffers, CURRENT and NEXT, filled by
/// an [`AsyncReadQueue`]. Reads look synchronous to the caller, but [`AsyncFileArchive::precache`]
/// lets a time-sliced caller poll for data instead of blocking on it.
///
/// When a compression map is set, positions are in uncompressed space and each precache fetches
/// whole chunks. Bytes after the last chunk form a raw bulk data area that is addressed right after
/// the uncompressed data.
pub struct AsyncFileArchive {
    path: Arc<PathBuf>,
    read_queue: Arc<AsyncReadQueue>,
    file_size: u64,
    uncompressed_size: u64,
    bulk_data_size: u64,
    position: u64,
    buffers: [PrecacheBuffer; 2],
    compression: Option<CompressionMap>,
    minimum_read_size: u64,
    open_failed: bool,
    read_failed: bool,
}

impl AsyncFileArchive {
    /// Opening never fails, a missing or empty file puts the archive in a permanent error state
    /// that callers check with [`AsyncFileArchive::has_error`].
    pub fn open(
        path: impl Into<PathBuf>,
        read_queue: Arc<AsyncReadQueue>,
        minimum_read_size: u64,
    ) -> Self {
        let path = path.into();
        let file_size = match std::fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                log::debug!("Couldn't open {:?}: {}", path, e);
                0
            }
        };

        let open_failed = file_size == 0;
        AsyncFileArchive {
            path: Arc::new(path),
            read_queue,
            file_size,
            uncompressed_size: file_size,
            bulk_data_size: 0,
            position: 0,
            buffers: Default::default(),
            compression: None,
            minimum_read_size: minimum_read_size.max(1),
            open_failed,
            read_failed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_error(&self) -> bool {
        self.open_failed || self.read_failed
    }

    pub fn tell(&self) -> u64 {
        self.position
    }

    pub fn total_size(&self) -> u64 {
        self.uncompressed_size + self.bulk_data_size
    }

    pub fn seek(
        &mut self,
        position: u64,
    ) {
        assert!(
            position <= self.total_size(),
            "Seeked past end of file {:?} ({} / {})",
            self.path,
            position,
            self.total_size()
        );
        self.position = position;
    }

    /// Switches to chunked reads. Returns false and leaves the archive in direct mode unless the
    /// chunks cover uncompressed space contiguously from offset 0 and every chunk lies inside the
    /// file.
    pub fn set_compression_map(
        &mut self,
        chunks: Vec<CompressedChunk>,
        flags: CompressionFlags,
    ) -> bool {
        let file_size = self.file_size;
        let contiguous = chunks
            .first()
            .map_or(false, |first| first.uncompressed_offset == 0)
            && chunks.iter().all(|chunk| {
                chunk.uncompressed_size > 0
                    && chunk
                        .compressed_offset
                        .checked_add(chunk.compressed_size)
                        .map_or(false, |end| end <= file_size)
            })
            && chunks.windows(2).all(|pair| {
                pair[0].uncompressed_offset.checked_add(pair[0].uncompressed_size)
                    == Some(pair[1].uncompressed_offset)
            });
        let last = match chunks.last() {
            Some(last) if contiguous => *last,
            _ => {
                log::warn!("Rejected compression map for {:?}", self.path);
                return false;
            }
        };

        self.flush_cache();

        let compressed_end = last.compressed_offset + last.compressed_size;
        self.uncompressed_size = last.uncompressed_offset + last.uncompressed_size;
        self.bulk_data_size = self.file_size.saturating_sub(compressed_end);
        self.compression = Some(CompressionMap {
            chunks,
            flags,
            compressed_end,
        });
        true
    }

    // Largest part of [offset, offset + size) that a single buffer can hold. Chunked reads
    // can't span a chunk boundary.
    fn clamp_request(
        &self,
        offset: u64,
        size: u64,
    ) -> u64 {
        let limit = match &self.compression {
            Some(map) if offset < self.uncompressed_size => {
                let chunk = &map.chunks[map.find_chunk_index(offset)];
                chunk.uncompressed_offset + chunk.uncompressed_size
            }
            _ => self.total_size(),
        };
        size.min(limit.saturating_sub(offset))
    }

    fn file_offset(
        &self,
        logical_offset: u64,
    ) -> u64 {
        match &self.compression {
            Some(map) => map.compressed_end + (logical_offset - self.uncompressed_size),
            None => logical_offset,
        }
    }

    // Uncompressed or bulk-area read of [start, end) into the given buffer
    fn issue_read(
        &mut self,
        buffer_index: usize,
        start: u64,
        end: u64,
    ) {
        let slot = Arc::new(ReadSlot::default());
        self.read_queue.add_request(ReadRequest {
            path: self.path.clone(),
            file_offset: self.file_offset(start),
            size: (end - start) as usize,
            encoding: ReadEncoding::Raw,
            slot: slot.clone(),
        });

        let buffer = &mut self.buffers[buffer_index];
        buffer.start = start;
        buffer.end = end;
        buffer.data = Vec::new();
        buffer.read = Some(slot);
    }

    fn precache_compressed_chunk(
        &mut self,
        chunk_index: usize,
        buffer_index: usize,
    ) {
        let (chunk, flags) = match &self.compression {
            Some(map) => (map.chunks[chunk_index], map.flags),
            None => return,
        };

        let encoding = match flags {
            CompressionFlags::None => ReadEncoding::Raw,
            CompressionFlags::Zlib => ReadEncoding::Zlib {
                uncompressed_size: chunk.uncompressed_size as usize,
            },
        };

        let slot = Arc::new(ReadSlot::default());
        self.read_queue.add_request(ReadRequest {
            path: self.path.clone(),
            file_offset: chunk.compressed_offset,
            size: chunk.compressed_size as usize,
            encoding,
            slot: slot.clone(),
        });

        let buffer = &mut self.buffers[buffer_index];
        buffer.start = chunk.uncompressed_offset;
        buffer.end = chunk.uncompressed_offset + chunk.uncompressed_size;
        buffer.data = Vec::new();
        buffer.read = Some(slot);
    }

    // Swaps CURRENT and NEXT. Both buffers must be finished.
    fn buffer_switcheroo(&mut self) {
        assert!(self.buffers[CURRENT].is_finished() && self.buffers[NEXT].is_finished());
        self.buffers.swap(CURRENT, NEXT);
        self.buffers[NEXT].reset();
    }

    /// Hint that [offset, offset + size) will be read soon. Returns true if the range is resident
    /// in the CURRENT buffer and its read has finished. Otherwise issues whatever reads are needed
    /// and returns false. Never blocks on IO.
    pub fn precache(
        &mut self,
        offset: u64,
        size: u64,
    ) -> bool {
        profiling::scope!("AsyncFileArchive::precache");
        if self.open_failed {
            // Nothing will ever arrive, let serialize report the error
            return true;
        }

        let size = self.clamp_request(offset, size);
        let finished_current = self.buffers[CURRENT].is_finished();
        let finished_next = self.buffers[NEXT].is_finished();

        if self.buffers[CURRENT].contains(offset, size) {
            if !finished_current {
                self.read_queue.poll();
                return self.buffers[CURRENT].is_finished();
            }
            return true;
        }

        // A read into either buffer is in flight, wait for it rather than stacking up requests
        if !finished_current || !finished_next {
            self.read_queue.poll();
            return false;
        }

        let chunk_index = match &self.compression {
            Some(map) if offset < self.uncompressed_size => Some(map.find_chunk_index(offset)),
            _ => None,
        };

        if let Some(chunk_index) = chunk_index {
            self.buffer_switcheroo();
            let is_cached = self.buffers[CURRENT].contains(offset, size);
            if !is_cached {
                self.precache_compressed_chunk(chunk_index, CURRENT);
            }

            let chunk_count = self.compression.as_ref().map_or(0, |map| map.chunks.len());
            if chunk_index + 1 < chunk_count {
                self.precache_compressed_chunk(chunk_index + 1, NEXT);
            }
            is_cached
        } else {
            // Sequential access usually lands in the readahead buffer
            if self.buffers[NEXT].contains(offset, size) {
                self.buffer_switcheroo();
                return true;
            }

            let total_size = self.total_size();
            let end = (offset + size.max(self.minimum_read_size)).min(total_size);
            self.issue_read(CURRENT, offset, end);

            if end < total_size {
                let next_end = (end + self.minimum_read_size).min(total_size);
                self.issue_read(NEXT, end, next_end);
            }
            false
        }
    }

    fn wait_for_buffer(
        &self,
        buffer_index: usize,
    ) {
        profiling::scope!("AsyncFileArchive::wait_for_buffer");
        while !self.buffers[buffer_index].is_finished() {
            self.read_queue.poll();
            std::thread::yield_now();
        }
    }

    /// Fills `dst` from the current position, blocking until the bytes are resident.
    ///
    /// Panics if the archive failed to open or the read would go past [`Self::total_size`].
    /// IO errors from the underlying read are returned.
    pub fn serialize(
        &mut self,
        dst: &mut [u8],
    ) -> std::io::Result<()> {
        assert!(
            !self.open_failed,
            "Serialize called on archive {:?} that failed to open",
            self.path
        );
        let count = dst.len() as u64;
        assert!(
            self.position + count <= self.total_size(),
            "Seeked past end of file {:?} ({} / {})",
            self.path,
            self.position + count,
            self.total_size()
        );

        let mut written = 0;
        while written < dst.len() {
            let remaining = (dst.len() - written) as u64;
            let buffer = &self.buffers[CURRENT];
            if self.position >= buffer.start && self.position < buffer.end {
                if !buffer.is_finished() {
                    self.wait_for_buffer(CURRENT);
                }
                if let Err(e) = self.buffers[CURRENT].resolve() {
                    self.read_failed = true;
                    return Err(e);
                }

                let buffer = &self.buffers[CURRENT];
                let begin = (self.position - buffer.start) as usize;
                let count = remaining.min(buffer.end - self.position) as usize;
                dst[written..written + count].copy_from_slice(&buffer.data[begin..begin + count]);
                written += count;
                self.position += count as u64;
            } else {
                // At most one read's worth so a sequential scan lands in the readahead buffer
                let request =
                    self.clamp_request(self.position, remaining.min(self.minimum_read_size));
                while !self.precache(self.position, request) {
                    self.read_queue.poll();
                    std::thread::yield_now();
                }
            }
        }

        Ok(())
    }

    /// Waits for reads into both buffers and releases their memory.
    pub fn flush_cache(&mut self) {
        self.wait_for_buffer(CURRENT);
        self.wait_for_buffer(NEXT);
        self.buffers[CURRENT].reset();
        self.buffers[NEXT].reset();
    }

    /// Flushes the cache. Returns true if there were no errors.
    pub fn close(&mut self) -> bool {
        self.flush_cache();
        !self.has_error()
    }
}

impl Drop for AsyncFileArchive {
    fn drop(&mut self) {
        self.flush_cache();
    }
}

impl std::io::Read for AsyncFileArchive {
    fn read(
        &mut self,
        buf: &mut [u8],
    ) -> std::io::Result<usize> {
        let count = (buf.len() as u64).min(self.total_size() - self.position) as usize;
        self.serialize(&mut buf[..count])?;
        Ok(count)
    }
}

impl std::io::Seek for AsyncFileArchive {
    fn seek(
        &mut self,
        pos: SeekFrom,
    ) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.total_size().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };

        match target {
            Some(target) if target <= self.total_size() => {
                AsyncFileArchive::seek(self, target);
                Ok(target)
            }
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid seek to {:?} in {:?}", pos, self.path),
            )),
        }
    }
}

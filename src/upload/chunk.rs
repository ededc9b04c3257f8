//! Chunk planning and slicing
//!
//! A file of `file_size` bytes is cut into `ceil(file_size / chunk_size)`
//! contiguous ranges. Slices are read from disk on demand so at most one
//! copy of each in-flight chunk is held in memory.

use bytes::Bytes;
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::UploadError;

/// Byte range `[start, end)` of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: u64,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    /// Number of bytes in the range
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// True for a zero-length range
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Layout of a file into chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
    total_chunks: u64,
}

impl ChunkPlan {
    /// Plan `file_size` bytes in chunks of `chunk_size`
    pub fn new(file_size: u64, chunk_size: u64) -> Result<Self, UploadError> {
        if chunk_size == 0 {
            return Err(UploadError::InvalidOptions(
                "chunk_size must be greater than zero".into(),
            ));
        }

        Ok(Self {
            file_size,
            chunk_size,
            total_chunks: file_size.div_ceil(chunk_size),
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    /// Range of chunk `index`, or `None` past the last chunk
    pub fn range(&self, index: u64) -> Option<ChunkRange> {
        if index >= self.total_chunks {
            return None;
        }
        let start = index * self.chunk_size;
        let end = start.saturating_add(self.chunk_size).min(self.file_size);
        Some(ChunkRange { index, start, end })
    }

    /// All ranges in index order
    pub fn ranges(&self) -> impl Iterator<Item = ChunkRange> + '_ {
        (0..self.total_chunks).filter_map(move |index| self.range(index))
    }
}

/// Read the bytes of `range` from the file at `path`
pub async fn read_chunk(path: &Path, range: ChunkRange) -> Result<Bytes, UploadError> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;

    let mut buf = vec![0u8; range.len() as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

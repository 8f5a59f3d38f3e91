//! Outgoing file sources. The file is referenced, not read, until chunks are
//! requested.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone)]
enum Content {
    Bytes(Arc<Vec<u8>>),
    Path(PathBuf),
}

/// A file offered to the peer.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    name: String,
    mime_type: String,
    size: u64,
    content: Content,
}

impl OutgoingFile {
    /// Wraps an in-memory buffer.
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size: data.len() as u64,
            content: Content::Bytes(Arc::new(data)),
        }
    }

    /// References a file on disk. Only its metadata is read here.
    pub async fn from_path(path: &Path, mime_type: Option<String>) -> Result<Self, std::io::Error> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self {
            name,
            mime_type: mime_type.unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            size: meta.len(),
            content: Content::Path(path.to_path_buf()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Opens a reader that slices the file into `chunk_size` pieces.
    pub async fn reader(&self, chunk_size: u32) -> Result<ChunkReader, std::io::Error> {
        let content = match &self.content {
            Content::Bytes(data) => ReaderContent::Bytes(Arc::clone(data)),
            Content::Path(path) => ReaderContent::File(tokio::fs::File::open(path).await?),
        };
        Ok(ChunkReader {
            content,
            chunk_size,
            size: self.size,
        })
    }
}

enum ReaderContent {
    Bytes(Arc<Vec<u8>>),
    File(tokio::fs::File),
}

/// Reads chunks by index, in any order.
pub struct ChunkReader {
    content: ReaderContent,
    chunk_size: u32,
    size: u64,
}

impl ChunkReader {
    /// Byte range `[start, end)` covered by chunk `index`.
    pub fn range(&self, index: u32) -> (u64, u64) {
        let start = index as u64 * self.chunk_size as u64;
        let end = (start + self.chunk_size as u64).min(self.size);
        (start.min(self.size), end)
    }

    /// Reads chunk `index`. The last chunk may be short.
    ///
    /// Fails with `UnexpectedEof` if a file on disk shrank since it was
    /// referenced.
    pub async fn read(&mut self, index: u32) -> Result<Vec<u8>, std::io::Error> {
        let (start, end) = self.range(index);
        let len = (end - start) as usize;
        match &mut self.content {
            ReaderContent::Bytes(data) => Ok(data[start as usize..end as usize].to_vec()),
            ReaderContent::File(file) => {
                file.seek(SeekFrom::Start(start)).await?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf).await?;
                Ok(buf)
            }
        }
    }
}

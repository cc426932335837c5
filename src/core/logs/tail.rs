use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_stream::Stream;

/// Upper bound on bytes consumed per read so a runaway writer cannot pin memory.
const MAX_CHUNK: u64 = 1024 * 1024;

/// A fragment without a newline longer than this is emitted as a line of its own.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Line reader over a growing file with an explicit byte offset.
///
/// The offset is plain state owned by the caller (it can be persisted and fed
/// back through [`LogTail::from_offset`]), never an open file cursor. Each read
/// reopens the file, so the tail survives rotation, deletion and truncation.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    offset: u64,
    pending: Vec<u8>,
}

impl LogTail {
    pub fn from_offset(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            pending: Vec::new(),
        }
    }

    /// Start at the current end of file, so only content written from now on is seen.
    pub async fn at_end(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let offset = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        Ok(Self::from_offset(path, offset))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the first byte not yet returned as part of a complete line.
    pub fn committed_offset(&self) -> u64 {
        self.offset - self.pending.len() as u64
    }

    /// Read everything appended since the last call and return the complete lines.
    ///
    /// A trailing fragment without a newline is held back until it is completed,
    /// unless it outgrows `MAX_LINE_BYTES`. If the file shrank below the offset
    /// it was truncated, and reading resumes from the start.
    pub async fn read_lines(&mut self) -> std::io::Result<Vec<String>> {
        self.read_lines_before(u64::MAX).await
    }

    /// Like [`LogTail::read_lines`], but never consumes bytes at or past `end`.
    pub async fn read_lines_before(&mut self, end: u64) -> std::io::Result<Vec<String>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let len = file.metadata().await?.len();

        if len < self.offset {
            self.offset = 0;
            self.pending.clear();
        }
        let want = len.min(end).saturating_sub(self.offset).min(MAX_CHUNK);
        if want == 0 {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::with_capacity(want as usize);
        let read = file.take(want).read_to_end(&mut buf).await?;
        self.offset += read as u64;
        self.pending.extend_from_slice(&buf[..read]);

        let mut lines = Vec::new();
        let mut consumed = 0;
        while let Some(pos) = self.pending[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + pos;
            let raw = &self.pending[consumed..end];
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            lines.push(String::from_utf8_lossy(raw).into_owned());
            consumed = end + 1;
        }
        self.pending.drain(..consumed);
        if self.pending.len() > MAX_LINE_BYTES {
            lines.push(String::from_utf8_lossy(&self.pending).into_owned());
            self.pending.clear();
        }
        Ok(lines)
    }

    /// Infinite lazy sequence of lines, polling for new content every `poll`.
    ///
    /// Read errors (for instance a missing file) are yielded and polling continues.
    pub fn lines(mut self, poll: Duration) -> impl Stream<Item = std::io::Result<String>> {
        async_stream::stream! {
            loop {
                match self.read_lines().await {
                    Ok(lines) => {
                        for line in lines {
                            yield Ok(line);
                        }
                    }
                    Err(e) => yield Err(e),
                }
                tokio::time::sleep(poll).await;
            }
        }
    }
}

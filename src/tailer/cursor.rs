//! Incremental reader for one log file.
//!
//! Rotation is a changed [`Fingerprint`]; truncation is a size below the
//! stored offset. A file truncated and rewritten between two polls whose new
//! content starts with every byte already consumed, and has grown past the
//! old offset, is indistinguishable from an append: only the bytes after the
//! old offset are emitted.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, trace};

/// Bytes sampled from the start of the file for the fingerprint.
pub const HEAD_SAMPLE_LEN: usize = 64;

/// Upper bound on bytes consumed per poll so one huge append cannot stall the loop.
const MAX_READ_PER_POLL: u64 = 8 * 1024 * 1024;

/// Identity of the file behind a path plus a sample of its first bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    identity: Option<(u64, u64)>,
    head: Vec<u8>,
}

impl Fingerprint {
    /// Same file, same beginning. A head sampled while the file was shorter
    /// only has to be a prefix of the current one.
    fn continues(&self, next: &Fingerprint) -> bool {
        let n = self.head.len().min(next.head.len());
        self.identity == next.identity && self.head[..n] == next.head[..n]
    }
}

#[cfg(unix)]
fn identity(meta: &std::fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn identity(meta: &std::fs::Metadata) -> Option<(u64, u64)> {
    meta.created()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| (d.as_secs(), d.subsec_nanos() as u64))
}

/// A complete line and the byte offset where it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailedLine {
    pub offset: u64,
    pub line: String,
}

#[derive(Debug, Default)]
pub struct Poll {
    pub lines: Vec<TailedLine>,
    /// The cursor restarted from offset 0 (rotation, truncation, rewrite).
    pub reset: bool,
}

/// Read position in one file.
///
/// `offset` is the number of bytes consumed from the file; the tail of those
/// bytes that has not yet seen a newline is held in `partial`.
#[derive(Debug)]
pub struct LogCursor {
    path: PathBuf,
    offset: u64,
    fingerprint: Option<Fingerprint>,
    partial: Vec<u8>,
}

impl LogCursor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            fingerprint: None,
            partial: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes waiting for a line terminator.
    pub fn pending_fragment(&self) -> &[u8] {
        &self.partial
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.partial.clear();
    }

    /// Reads whatever was appended since the last poll. A missing file is not
    /// an error: nothing is returned and the next appearance starts at 0.
    pub async fn poll(&mut self) -> std::io::Result<Poll> {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if self.fingerprint.take().is_some() {
                    debug!(path = %self.path.display(), "Log file disappeared");
                }
                self.reset();
                return Ok(Poll::default());
            }
            Err(e) => return Err(e),
        };
        let meta = file.metadata().await?;
        let size = meta.len();

        let mut head = Vec::with_capacity(HEAD_SAMPLE_LEN);
        (&mut file)
            .take(HEAD_SAMPLE_LEN as u64)
            .read_to_end(&mut head)
            .await?;
        let fingerprint = Fingerprint {
            identity: identity(&meta),
            head,
        };

        let mut poll = Poll::default();
        let rotated = self
            .fingerprint
            .as_ref()
            .is_some_and(|old| !old.continues(&fingerprint));
        if rotated || size < self.offset {
            debug!(
                path = %self.path.display(),
                offset = self.offset,
                size,
                rotated,
                "Log file rotated or truncated, restarting from 0"
            );
            self.reset();
            poll.reset = true;
        }
        self.fingerprint = Some(fingerprint);

        if size <= self.offset {
            return Ok(poll);
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut chunk = Vec::new();
        file.take((size - self.offset).min(MAX_READ_PER_POLL))
            .read_to_end(&mut chunk)
            .await?;
        trace!(path = %self.path.display(), offset = self.offset, read = chunk.len(), "Read log bytes");

        let mut line_start = self.offset - self.partial.len() as u64;
        self.offset += chunk.len() as u64;
        self.partial.extend_from_slice(&chunk);

        let mut consumed = 0;
        while let Some(pos) = self.partial[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + pos;
            let mut raw = &self.partial[consumed..end];
            if let Some(stripped) = raw.strip_suffix(b"\r") {
                raw = stripped;
            }
            poll.lines.push(TailedLine {
                offset: line_start,
                line: String::from_utf8_lossy(raw).into_owned(),
            });
            line_start += (end + 1 - consumed) as u64;
            consumed = end + 1;
        }
        self.partial.drain(..consumed);
        Ok(poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(path: &Path, data: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(data.as_bytes()).unwrap();
    }

    fn texts(poll: &Poll) -> Vec<&str> {
        poll.lines.iter().map(|l| l.line.as_str()).collect()
    }

    #[tokio::test]
    async fn incremental_appends_hold_back_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.ADM");
        let mut cursor = LogCursor::new(&path);

        append(&path, "A\n");
        assert_eq!(texts(&cursor.poll().await.unwrap()), vec!["A"]);
        append(&path, "B\n");
        assert_eq!(texts(&cursor.poll().await.unwrap()), vec!["B"]);
        append(&path, "C");
        assert!(cursor.poll().await.unwrap().lines.is_empty());
        assert_eq!(cursor.pending_fragment(), b"C");
        assert_eq!(cursor.offset(), 5);

        append(&path, "\n");
        let poll = cursor.poll().await.unwrap();
        assert_eq!(
            poll.lines,
            vec![TailedLine {
                offset: 4,
                line: "C".into()
            }]
        );
    }

    #[tokio::test]
    async fn missing_file_waits_then_reads_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.log");
        let mut cursor = LogCursor::new(&path);
        assert!(cursor.poll().await.unwrap().lines.is_empty());

        append(&path, "first\nsecond\n");
        let poll = cursor.poll().await.unwrap();
        assert_eq!(texts(&poll), vec!["first", "second"]);
        assert_eq!(poll.lines[1].offset, 6);
    }

    #[tokio::test]
    async fn truncation_restarts_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.log");
        let mut cursor = LogCursor::new(&path);

        append(&path, "one\ntwo\n");
        assert_eq!(texts(&cursor.poll().await.unwrap()), vec!["one", "two"]);

        std::fs::write(&path, "").unwrap();
        append(&path, "three\n");
        let poll = cursor.poll().await.unwrap();
        assert!(poll.reset);
        assert_eq!(texts(&poll), vec!["three"]);
        assert!(cursor.poll().await.unwrap().lines.is_empty());
    }

    #[tokio::test]
    async fn rewrite_longer_than_offset_is_detected_by_head() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.RPT");
        let mut cursor = LogCursor::new(&path);

        append(&path, "old line\n");
        cursor.poll().await.unwrap();

        std::fs::write(&path, "new content that is longer\nand more\n").unwrap();
        let poll = cursor.poll().await.unwrap();
        assert!(poll.reset);
        assert_eq!(texts(&poll), vec!["new content that is longer", "and more"]);
    }

    #[tokio::test]
    async fn rewrite_keeping_consumed_prefix_reads_as_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.ADM");
        let mut cursor = LogCursor::new(&path);

        append(&path, "A\n");
        assert_eq!(texts(&cursor.poll().await.unwrap()), vec!["A"]);

        std::fs::write(&path, "A\nB\n").unwrap();
        let poll = cursor.poll().await.unwrap();
        assert!(!poll.reset);
        assert_eq!(texts(&poll), vec!["B"]);
    }

    #[tokio::test]
    async fn replaced_file_is_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.log");
        let mut cursor = LogCursor::new(&path);

        append(&path, "same head\n");
        cursor.poll().await.unwrap();

        let rotated = dir.path().join("script.log.1");
        std::fs::rename(&path, &rotated).unwrap();
        append(&path, "same head\nfresh\n");
        let poll = cursor.poll().await.unwrap();
        if cfg!(unix) {
            assert!(poll.reset);
            assert_eq!(texts(&poll), vec!["same head", "fresh"]);
        }
    }

    #[tokio::test]
    async fn crlf_is_trimmed_and_fragment_dropped_on_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crlf.log");
        let mut cursor = LogCursor::new(&path);

        append(&path, "win\r\nhalf");
        assert_eq!(texts(&cursor.poll().await.unwrap()), vec!["win"]);

        std::fs::write(&path, "x\n").unwrap();
        let poll = cursor.poll().await.unwrap();
        assert_eq!(texts(&poll), vec!["x"]);
        assert!(cursor.pending_fragment().is_empty());
    }
}

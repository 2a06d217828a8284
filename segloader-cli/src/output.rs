use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use segloader::{AppendPayload, BufferError, MediaBuffer, TimeRanges};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::AppError;

/// Media buffer that writes every append to a file.
///
/// Buffered ranges are tracked from the payload spans so the loader sees a
/// regular buffer; removals only forget ranges, written bytes stay on disk.
pub struct FileMediaBuffer {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
    buffered: Mutex<TimeRanges>,
    timestamp_offset: Mutex<f64>,
    bytes_written: AtomicU64,
}

impl FileMediaBuffer {
    pub async fn create(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(path).await?;
        info!(path = %path.display(), "Writing appended segments");
        Ok(Self {
            path: path.to_path_buf(),
            file: tokio::sync::Mutex::new(file),
            buffered: Mutex::new(TimeRanges::new()),
            timestamp_offset: Mutex::new(0.0),
            bytes_written: AtomicU64::new(0),
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub async fn finish(&self) -> Result<(), AppError> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_all().await?;
        info!(
            path = %self.path.display(),
            bytes = self.bytes_written(),
            "Output file finalized"
        );
        Ok(())
    }
}

#[async_trait]
impl MediaBuffer for FileMediaBuffer {
    async fn append(&self, payload: AppendPayload) -> Result<(), BufferError> {
        let mut file = self.file.lock().await;
        file.write_all(&payload.bytes)
            .await
            .map_err(|e| BufferError::InvalidState(format!("write failed: {e}")))?;
        self.bytes_written
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        if let Some((start, end)) = payload.span {
            let offset = *self.timestamp_offset.lock();
            self.buffered.lock().insert(start + offset, end + offset);
        }
        debug!(bytes = payload.len(), span = ?payload.span, "Appended to output");
        Ok(())
    }

    async fn remove(&self, start: f64, end: f64) -> Result<(), BufferError> {
        self.buffered.lock().remove(start, end);
        Ok(())
    }

    fn set_timestamp_offset(&self, offset: f64) {
        *self.timestamp_offset.lock() = offset;
    }

    fn timestamp_offset(&self) -> f64 {
        *self.timestamp_offset.lock()
    }

    fn buffered(&self) -> TimeRanges {
        self.buffered.lock().clone()
    }

    fn abort(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("segloader-cli-{}-{name}", std::process::id()))
    }

    #[tokio::test]
    async fn test_appends_are_written_and_tracked() {
        let path = temp_path("appends.ts");
        let buffer = FileMediaBuffer::create(&path).await.unwrap();

        buffer
            .append(AppendPayload::new(Bytes::from_static(b"abc")).with_span(0.0, 4.0))
            .await
            .unwrap();
        buffer.set_timestamp_offset(10.0);
        buffer
            .append(AppendPayload::new(Bytes::from_static(b"def")).with_span(-6.0, -2.0))
            .await
            .unwrap();
        buffer.finish().await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abcdef");
        assert_eq!(buffer.bytes_written(), 6);
        assert_eq!(buffer.buffered().iter().collect::<Vec<_>>(), vec![(0.0, 8.0)]);

        buffer.remove(0.0, 5.0).await.unwrap();
        assert_eq!(buffer.buffered().iter().collect::<Vec<_>>(), vec![(5.0, 8.0)]);
        let _ = tokio::fs::remove_file(&path).await;
    }
}

//! # Buffer Update Queue
//!
//! `SourceUpdater` owns one [`MediaBuffer`] per media type and runs every
//! mutation for a type through a FIFO worker task, so at most one append,
//! remove or offset change is in flight per buffer. Buffers of different types
//! progress independently.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::buffer::{AppendPayload, MediaBuffer, MediaType};
use crate::error::BufferError;
use crate::ranges::TimeRanges;

enum Action {
    Append {
        payload: AppendPayload,
        done: oneshot::Sender<Result<(), BufferError>>,
    },
    Remove {
        start: f64,
        end: f64,
        done: oneshot::Sender<Result<(), BufferError>>,
    },
    TimestampOffset {
        offset: f64,
    },
}

/// Resolves when a queued mutation has been executed. Dropping it does not
/// cancel the mutation.
pub struct Completion {
    rx: Option<oneshot::Receiver<Result<(), BufferError>>>,
    immediate: Option<Result<(), BufferError>>,
}

impl Completion {
    fn pending(rx: oneshot::Receiver<Result<(), BufferError>>) -> Self {
        Self {
            rx: Some(rx),
            immediate: None,
        }
    }

    fn ready(result: Result<(), BufferError>) -> Self {
        Self {
            rx: None,
            immediate: Some(result),
        }
    }
}

impl Future for Completion {
    type Output = Result<(), BufferError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.immediate.take() {
            return Poll::Ready(result);
        }
        match self.rx.as_mut() {
            // A dropped sender means the queue was disposed before running the action.
            Some(rx) => Pin::new(rx)
                .poll(cx)
                .map(|r| r.unwrap_or(Err(BufferError::Aborted))),
            None => Poll::Ready(Err(BufferError::Aborted)),
        }
    }
}

struct TypeQueue {
    media_type: MediaType,
    buffer: Arc<dyn MediaBuffer>,
    tx: mpsc::UnboundedSender<Action>,
    updating: Arc<AtomicBool>,
    timestamp_offset: Mutex<f64>,
}

impl TypeQueue {
    fn spawn(media_type: MediaType, buffer: Arc<dyn MediaBuffer>, token: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let updating = Arc::new(AtomicBool::new(false));
        let initial_offset = buffer.timestamp_offset();
        tokio::spawn(run_queue(
            media_type,
            buffer.clone(),
            rx,
            updating.clone(),
            token,
        ));
        Self {
            media_type,
            buffer,
            tx,
            updating,
            timestamp_offset: Mutex::new(initial_offset),
        }
    }

    fn push(&self, action: Action) -> bool {
        if self.tx.send(action).is_err() {
            warn!(media_type = %self.media_type, "Buffer queue closed, dropping action");
            return false;
        }
        true
    }
}

async fn run_queue(
    media_type: MediaType,
    buffer: Arc<dyn MediaBuffer>,
    mut rx: mpsc::UnboundedReceiver<Action>,
    updating: Arc<AtomicBool>,
    token: CancellationToken,
) {
    loop {
        let action = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            action = rx.recv() => match action {
                Some(action) => action,
                None => break,
            },
        };

        match action {
            Action::Append { payload, done } => {
                updating.store(true, Ordering::SeqCst);
                let len = payload.len();
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        buffer.abort();
                        Err(BufferError::Aborted)
                    }
                    result = buffer.append(payload) => result,
                };
                updating.store(false, Ordering::SeqCst);
                trace!(media_type = %media_type, bytes = len, ok = result.is_ok(), "Append finished");
                let _ = done.send(result);
            }
            Action::Remove { start, end, done } => {
                // Removes run to completion even when disposal is requested meanwhile.
                updating.store(true, Ordering::SeqCst);
                let result = buffer.remove(start, end).await;
                updating.store(false, Ordering::SeqCst);
                trace!(media_type = %media_type, start, end, ok = result.is_ok(), "Remove finished");
                let _ = done.send(result);
                if token.is_cancelled() {
                    buffer.abort();
                    break;
                }
            }
            Action::TimestampOffset { offset } => {
                buffer.set_timestamp_offset(offset);
                trace!(media_type = %media_type, offset, "Timestamp offset applied");
            }
        }
    }
    debug!(media_type = %media_type, "Buffer queue stopped");
}

/// Serializing front of the audio and video buffers, shared by every loader
/// that targets them.
pub struct SourceUpdater {
    audio: Option<TypeQueue>,
    video: Option<TypeQueue>,
    audio_disabled: AtomicBool,
    token: CancellationToken,
}

impl SourceUpdater {
    /// Spawns one worker per attached buffer; must be called within a Tokio
    /// runtime.
    pub fn new(audio: Option<Arc<dyn MediaBuffer>>, video: Option<Arc<dyn MediaBuffer>>) -> Self {
        let token = CancellationToken::new();
        Self {
            audio: audio.map(|b| TypeQueue::spawn(MediaType::Audio, b, token.child_token())),
            video: video.map(|b| TypeQueue::spawn(MediaType::Video, b, token.child_token())),
            audio_disabled: AtomicBool::new(false),
            token,
        }
    }

    fn queue(&self, media_type: MediaType) -> Option<&TypeQueue> {
        match media_type {
            MediaType::Audio => self.audio.as_ref(),
            MediaType::Video => self.video.as_ref(),
        }
    }

    /// At least one buffer is attached and the updater has not been disposed.
    pub fn ready(&self) -> bool {
        (self.audio.is_some() || self.video.is_some()) && !self.token.is_cancelled()
    }

    pub fn has_buffer(&self, media_type: MediaType) -> bool {
        self.queue(media_type).is_some()
    }

    pub fn append_buffer(&self, media_type: MediaType, payload: AppendPayload) -> Completion {
        let Some(queue) = self.queue(media_type) else {
            return Completion::ready(Err(BufferError::Missing(media_type)));
        };
        let (done, rx) = oneshot::channel();
        if !queue.push(Action::Append { payload, done }) {
            return Completion::ready(Err(BufferError::Aborted));
        }
        Completion::pending(rx)
    }

    pub fn remove(&self, media_type: MediaType, start: f64, end: f64) -> Completion {
        let Some(queue) = self.queue(media_type) else {
            return Completion::ready(Err(BufferError::Missing(media_type)));
        };
        let (done, rx) = oneshot::channel();
        if !queue.push(Action::Remove { start, end, done }) {
            return Completion::ready(Err(BufferError::Aborted));
        }
        Completion::pending(rx)
    }

    pub fn set_timestamp_offset(&self, media_type: MediaType, offset: f64) {
        if let Some(queue) = self.queue(media_type)
            && queue.push(Action::TimestampOffset { offset })
        {
            *queue.timestamp_offset.lock() = offset;
        }
    }

    /// The most recently requested offset for a type.
    pub fn timestamp_offset(&self, media_type: MediaType) -> Option<f64> {
        self.queue(media_type).map(|q| *q.timestamp_offset.lock())
    }

    pub fn is_updating(&self, media_type: MediaType) -> bool {
        self.queue(media_type)
            .is_some_and(|q| q.updating.load(Ordering::SeqCst))
    }

    /// Exclude audio from [`SourceUpdater::buffered`], e.g. while audio is
    /// served by a separate loader.
    pub fn set_audio_disabled(&self, disabled: bool) {
        self.audio_disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn audio_buffered(&self) -> TimeRanges {
        self.audio
            .as_ref()
            .map(|q| q.buffer.buffered())
            .unwrap_or_default()
    }

    pub fn video_buffered(&self) -> TimeRanges {
        self.video
            .as_ref()
            .map(|q| q.buffer.buffered())
            .unwrap_or_default()
    }

    /// Intersection of the active buffers' ranges.
    pub fn buffered(&self) -> TimeRanges {
        let audio_active = self.audio.is_some() && !self.audio_disabled.load(Ordering::SeqCst);
        match (audio_active, self.video.is_some()) {
            (true, true) => self.audio_buffered().intersection(&self.video_buffered()),
            (true, false) => self.audio_buffered(),
            (false, true) => self.video_buffered(),
            (false, false) => TimeRanges::new(),
        }
    }

    /// Abort in-flight appends and stop both workers. Queued actions resolve
    /// with [`BufferError::Aborted`].
    pub fn dispose(&self) {
        debug!("Disposing source updater");
        self.token.cancel();
    }
}

impl Drop for SourceUpdater {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

//! # Segloader
//!
//! Segment scheduling and media buffer synchronization for adaptive
//! streaming clients.
//!
//! ## Features
//!
//! - Next-segment selection against a goal buffer, with LL-HLS parts
//! - Serialized per-type buffer operations with abort and quota recovery
//! - AES-128 decryption with a key cache and shared init segments
//! - 90 kHz rollover correction and timestamp offset management
//! - Timeline gating between main, audio and subtitle loaders

pub mod buffer;
pub mod builder;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod loader;
pub mod playback;
pub mod playlist;
pub mod ranges;
pub mod source_updater;
pub mod sync;
pub mod testing;
pub mod text_track;
pub mod timeline;
pub mod transmux;
pub mod transport;

pub use builder::{LoaderConfigBuilder, TransportConfigBuilder};
pub use config::{LoaderConfig, TransportConfig};
pub use error::{BufferError, DecryptError, ErrorKind, LoaderError, RequestError, TransmuxError};

// Collaborator seams
pub use buffer::{AppendPayload, MediaBuffer, MediaType};
pub use playback::Playback;
pub use sync::{SegmentTiming, SyncController, SyncPoint, SyncSource};
pub use text_track::{Cue, TextTrack};
pub use transmux::{TrackInfo, TransmuxJob, TransmuxMessage, Transmuxer};
pub use transport::{HttpTransport, MediaRequest, MediaResponse, ReqwestTransport, create_client};

// Loader
pub use events::{EventEmitter, LoaderEvent};
pub use loader::{
    LoaderDeps, LoaderKind, LoaderSnapshot, LoaderState, LoaderStats, SegmentLoader,
};
pub use playlist::{ByteRange, InitSegment, KeyDescriptor, Part, Playlist, Segment};
pub use ranges::TimeRanges;
pub use source_updater::SourceUpdater;
pub use timeline::{TimelineChange, TimelineChangeController, TimelineRole};

use crate::ranges::TimeRanges;

/// Read-only view of the playback element a loader feeds.
pub trait Playback: Send + Sync {
    /// Playhead position in seconds.
    fn current_time(&self) -> f64;

    /// Presentation duration; infinite for live content.
    fn duration(&self) -> f64;

    /// Window that can currently be seeked to.
    fn seekable(&self) -> TimeRanges;

    fn seeking(&self) -> bool;

    /// Playback has started at least once.
    fn has_played(&self) -> bool;

    /// The media source has been marked as ended.
    fn ended(&self) -> bool;
}

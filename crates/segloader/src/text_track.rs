use crate::ranges::TimeRanges;

/// A subtitle or caption cue, times in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl Cue {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }

    pub fn shifted(&self, offset: f64) -> Self {
        Self {
            start: self.start + offset,
            end: self.end + offset,
            text: self.text.clone(),
        }
    }
}

/// Destination of subtitle cues produced by a subtitle loader.
pub trait TextTrack: Send + Sync {
    fn add_cues(&self, cues: Vec<Cue>);

    fn remove_cues(&self, start: f64, end: f64);

    /// Time covered by the cues held.
    fn buffered(&self) -> TimeRanges;
}

use serde::{Deserialize, Deserializer, Serialize};
use time::Date;

use super::day;

pub const MIN_EMOTION_SCALE: u8 = 0;
pub const MAX_EMOTION_SCALE: u8 = 10;
/// Rating of an untouched entry.
pub const DEFAULT_EMOTION_SCALE: u8 = 5;

/// One day's mood rating and free text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Server-assigned; empty until the entry has been stored remotely.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(
        default = "default_emotion_scale",
        deserialize_with = "deserialize_emotion_scale"
    )]
    pub emotion_scale: u8,
    pub date: String,
    #[serde(default)]
    pub ephemeral: bool,
    /// Client-side only: the copy is known to match the remote store.
    #[serde(default)]
    pub saved: bool,
}

impl Entry {
    /// Untouched local draft for `today`.
    pub fn blank(today: Date) -> Self {
        Self {
            id: String::new(),
            author: String::new(),
            text: Some(String::new()),
            emotion_scale: DEFAULT_EMOTION_SCALE,
            date: day::stamp(today),
            ephemeral: false,
            saved: false,
        }
    }

    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }

    /// No user input yet: empty text and the default rating.
    pub fn is_blank(&self) -> bool {
        self.text().is_empty() && self.emotion_scale == DEFAULT_EMOTION_SCALE
    }

    /// Equality over the fields that are synchronised with the server.
    pub fn same_content(&self, other: &Entry) -> bool {
        self.text() == other.text()
            && self.emotion_scale == other.emotion_scale
            && self.ephemeral == other.ephemeral
    }

    pub fn set_emotion_scale(&mut self, rating: u8) {
        self.emotion_scale = rating.min(MAX_EMOTION_SCALE);
    }

    /// Restores the invariants an arbitrary edit may have broken.
    pub(crate) fn normalize(&mut self) {
        self.emotion_scale = self.emotion_scale.min(MAX_EMOTION_SCALE);
        if self.text.is_none() {
            self.text = Some(String::new());
        }
    }
}

/// A fetched entry that disagrees with local edits, awaiting a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveConflict {
    pub remote: Entry,
    pub local: Entry,
}

fn default_emotion_scale() -> u8 {
    DEFAULT_EMOTION_SCALE
}

// The server stores ratings as floats.
fn deserialize_emotion_scale<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    let raw = f64::deserialize(deserializer)?;
    if raw.is_nan() {
        return Ok(DEFAULT_EMOTION_SCALE);
    }
    let clamped = raw
        .round()
        .clamp(f64::from(MIN_EMOTION_SCALE), f64::from(MAX_EMOTION_SCALE));
    Ok(clamped as u8)
}

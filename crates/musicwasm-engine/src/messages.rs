//! Response messages returned by the music module.
//!
//! There is no shared response envelope: the caller picks the message type
//! from the call it issued. Fields the module omits fall back to defaults.

use serde::{Deserialize, Serialize};

/// A playable stream of a track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaFormat {
    pub id: String,
    pub url: String,
    pub mime: String,
    pub bitrate: Option<u32>,
    pub duration: Option<f64>,
}

/// Result of `MUSIC_CALL_ID_GET_DETAILS`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackDetails {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
    pub formats: Vec<MediaFormat>,
}

/// A search / listing entry. Playlists share this shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub kind: String,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
}

impl Track {
    pub fn is_playlist(&self) -> bool {
        self.kind.ends_with("#playlist")
    }
}

/// Result of search, playlist and discover calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListTracks {
    pub items: Vec<Track>,
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListSuggestions {
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionEntry {
    pub id: String,
    pub name: String,
    pub desc: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListOptions {
    pub options: Vec<OptionEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptLine {
    pub start: f64,
    pub duration: f64,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transcript {
    pub id: String,
    pub lines: Vec<TranscriptLine>,
}

/// Out-of-band event a module may answer with instead of the expected message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ModuleEvent {
    Error { code: i32, reason: String },
}

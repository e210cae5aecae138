//! Call identifiers and their wire strings.
//!
//! A call id is rendered from the owning type name and the case name, each
//! split on lowercase→uppercase boundaries, uppercased and joined with `_`:
//! `MusicCallID.getDetails` becomes `MUSIC_CALL_ID_GET_DETAILS`.
//!
//! The owner prefix is always prepended, even when the case name already
//! starts with it (`Foo.fooBar` → `FOO_FOO_BAR`). Modules match on these
//! literal strings, so the rule is kept as is.

use std::sync::LazyLock;

use regex::Regex;

static CASE_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("([a-z])([A-Z])").expect("case boundary pattern is valid"));

/// Render one identifier segment as SCREAMING_SNAKE_CASE.
///
/// Only lowercase→uppercase boundaries split; digits and existing
/// underscores are kept (`bar2` → `BAR2`, `bar_3` → `BAR_3`).
pub fn screaming_snake(segment: &str) -> String {
    CASE_BOUNDARY
        .replace_all(segment, "${1}_${2}")
        .to_uppercase()
}

/// An enumerable opcode that can be sent to a module.
pub trait CallerId {
    /// Name of the owning type as the module knows it.
    const OWNER: &'static str;

    /// Case name of this variant as the module knows it.
    fn case_name(&self) -> &'static str;

    /// Wire string for this variant.
    fn to_call_id(&self) -> String {
        format!(
            "{}_{}",
            screaming_snake(Self::OWNER),
            screaming_snake(self.case_name())
        )
    }
}

/// Music service operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MusicCallId {
    GetDetails,
    GetTranscript,
    Search,
    GetOptions,
    Suggestion,
    GetDiscover,
    GetPlaylistDetails,
}

impl MusicCallId {
    pub const ALL: [MusicCallId; 7] = [
        Self::GetDetails,
        Self::GetTranscript,
        Self::Search,
        Self::GetOptions,
        Self::Suggestion,
        Self::GetDiscover,
        Self::GetPlaylistDetails,
    ];
}

impl CallerId for MusicCallId {
    const OWNER: &'static str = "MusicCallID";

    fn case_name(&self) -> &'static str {
        match self {
            Self::GetDetails => "getDetails",
            Self::GetTranscript => "getTranscript",
            Self::Search => "search",
            Self::GetOptions => "getOptions",
            Self::Suggestion => "suggestion",
            Self::GetDiscover => "getDiscover",
            Self::GetPlaylistDetails => "getPlaylistDetails",
        }
    }
}

/// Engine housekeeping operations every module implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineCallId {
    Initialize,
    GetVersion,
}

impl EngineCallId {
    pub const ALL: [EngineCallId; 2] = [Self::Initialize, Self::GetVersion];
}

impl CallerId for EngineCallId {
    const OWNER: &'static str = "EngineCallID";

    fn case_name(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::GetVersion => "getVersion",
        }
    }
}

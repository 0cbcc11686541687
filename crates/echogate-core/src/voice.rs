//! Session-configuration value types: voice selection and response length,
//! both parsed leniently from client-supplied query parameters with a
//! documented fallback for unrecognized values.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Voice {
    Alloy,
    Ash,
    Ballad,
    Coral,
    Echo,
    Sage,
    Shimmer,
    Verse,
    Marin,
    Cedar,
}

impl Voice {
    /// Parse a client-supplied voice name, falling back to `alloy` for
    /// anything unrecognized (including absent/empty input).
    pub fn parse_or_default(raw: Option<&str>) -> Self {
        match raw.map(str::to_ascii_lowercase).as_deref() {
            Some("alloy") => Voice::Alloy,
            Some("ash") => Voice::Ash,
            Some("ballad") => Voice::Ballad,
            Some("coral") => Voice::Coral,
            Some("echo") => Voice::Echo,
            Some("sage") => Voice::Sage,
            Some("shimmer") => Voice::Shimmer,
            Some("verse") => Voice::Verse,
            Some("marin") => Voice::Marin,
            Some("cedar") => Voice::Cedar,
            _ => Voice::Alloy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Voice::Alloy => "alloy",
            Voice::Ash => "ash",
            Voice::Ballad => "ballad",
            Voice::Coral => "coral",
            Voice::Echo => "echo",
            Voice::Sage => "sage",
            Voice::Shimmer => "shimmer",
            Voice::Verse => "verse",
            Voice::Marin => "marin",
            Voice::Cedar => "cedar",
        }
    }
}

impl Default for Voice {
    fn default() -> Self {
        Voice::Alloy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseLength {
    Short,
    Normal,
    Long,
}

impl ResponseLength {
    pub fn parse_or_default(raw: Option<&str>) -> Self {
        match raw.map(str::to_ascii_lowercase).as_deref() {
            Some("short") => ResponseLength::Short,
            Some("long") => ResponseLength::Long,
            Some("normal") => ResponseLength::Normal,
            _ => ResponseLength::Normal,
        }
    }
}

impl Default for ResponseLength {
    fn default() -> Self {
        ResponseLength::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_voice_falls_back_to_alloy() {
        assert_eq!(Voice::parse_or_default(Some("nonexistent")), Voice::Alloy);
        assert_eq!(Voice::parse_or_default(None), Voice::Alloy);
    }

    #[test]
    fn known_voice_is_case_insensitive() {
        assert_eq!(Voice::parse_or_default(Some("CEDAR")), Voice::Cedar);
    }

    #[test]
    fn unknown_response_length_falls_back_to_normal() {
        assert_eq!(
            ResponseLength::parse_or_default(Some("extra-long")),
            ResponseLength::Normal
        );
    }

    #[test]
    fn known_response_lengths_parse() {
        assert_eq!(
            ResponseLength::parse_or_default(Some("short")),
            ResponseLength::Short
        );
        assert_eq!(
            ResponseLength::parse_or_default(Some("long")),
            ResponseLength::Long
        );
    }
}

//! Payload Policy
//!
//! Decides how a decoded payload becomes deliverable units.
//!
//! ```text
//! Payload("Hi") ──┬── Passthrough ──► Unit("Hi")
//!                 └── PacedTyping ──► Unit("H"), Unit("i") ──► PacingScheduler
//! ```
//!
//! Paced typing splits on extended grapheme clusters, so a combining accent
//! or a multi-codepoint emoji is never torn apart on screen.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

/// Strategy applied to each decoded payload
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadPolicy {
    /// Emit each payload verbatim and immediately
    ///
    /// For structured documents (JSON) assembled by the consumer.
    Passthrough,
    /// Split each payload into graphemes and re-time delivery
    #[default]
    #[serde(alias = "paced")]
    PacedTyping,
}

impl PayloadPolicy {
    /// Whether units go through the pacing scheduler
    #[must_use]
    pub fn is_paced(self) -> bool {
        matches!(self, Self::PacedTyping)
    }

    /// Split one payload into units' text, in source order
    #[must_use]
    pub fn split(self, payload: &str) -> Vec<String> {
        match self {
            Self::Passthrough => vec![payload.to_string()],
            Self::PacedTyping => payload.graphemes(true).map(str::to_string).collect(),
        }
    }
}

impl fmt::Display for PayloadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passthrough => write!(f, "passthrough"),
            Self::PacedTyping => write!(f, "paced"),
        }
    }
}

impl FromStr for PayloadPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "passthrough" | "raw" => Ok(Self::Passthrough),
            "paced" | "paced-typing" | "typing" => Ok(Self::PacedTyping),
            other => Err(format!("unknown payload policy: {other}")),
        }
    }
}

/// Smallest deliverable item
///
/// `seq` is the emission order within one stream, starting at 0.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub seq: u64,
    pub text: String,
}

impl Unit {
    #[must_use]
    pub fn new(seq: u64, text: impl Into<String>) -> Self {
        Self {
            seq,
            text: text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_passthrough_keeps_payload_whole() {
        let parts = PayloadPolicy::Passthrough.split("{\"topic\": \"Rust\",\n  ");
        assert_eq!(parts, vec!["{\"topic\": \"Rust\",\n  ".to_string()]);
    }

    #[test]
    fn test_paced_splits_characters_in_order() {
        let parts = PayloadPolicy::PacedTyping.split("Hi there");
        assert_eq!(parts.concat(), "Hi there");
        assert_eq!(parts.len(), 8);
        assert_eq!(parts[0], "H");
        assert_eq!(parts[1], "i");
    }

    #[test]
    fn test_paced_keeps_graphemes_intact() {
        // "e" + combining acute, then a family emoji joined by ZWJ
        let text = "e\u{301}\u{1f468}\u{200d}\u{1f469}\u{200d}\u{1f467}";
        let parts = PayloadPolicy::PacedTyping.split(text);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn test_policy_parse_and_display() {
        assert_eq!("paced".parse::<PayloadPolicy>(), Ok(PayloadPolicy::PacedTyping));
        assert_eq!("Passthrough".parse::<PayloadPolicy>(), Ok(PayloadPolicy::Passthrough));
        assert!("bursty".parse::<PayloadPolicy>().is_err());
        assert_eq!(PayloadPolicy::PacedTyping.to_string(), "paced");
        assert!(PayloadPolicy::default().is_paced());
    }
}

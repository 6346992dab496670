//! Upstream speech result messages.
//!
//! The streaming endpoint sends JSON text messages; only `Results` messages
//! with at least one alternative and a non-empty transcript are forwarded.
//! Anything else (metadata, utterance markers, unknown types) is ignored.

use serde::{Deserialize, Serialize};

/// One recognized word with timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Word {
    pub word: String,
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub punctuated_word: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Alternative {
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub words: Vec<Word>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultChannel {
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeechMessage {
    #[serde(rename = "type")]
    pub message_type: Option<String>,
    #[serde(default)]
    pub channel: Option<ResultChannel>,
    #[serde(default)]
    pub is_final: Option<bool>,
}

/// A transcript worth forwarding.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
    pub words: Vec<Word>,
}

impl Transcript {
    /// Extract a forwardable transcript from a raw text message, if any.
    pub fn from_message(text: &str) -> Option<Transcript> {
        let message: SpeechMessage = serde_json::from_str(text).ok()?;
        if message.message_type.as_deref() != Some("Results") {
            return None;
        }
        let alternative = message.channel?.alternatives.into_iter().next()?;
        if alternative.transcript.is_empty() {
            return None;
        }
        Some(Transcript {
            text: alternative.transcript,
            is_final: message.is_final.unwrap_or(false),
            words: alternative.words,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_results_with_transcript() {
        let body = r#"{
            "type": "Results",
            "is_final": true,
            "channel": {
                "alternatives": [{
                    "transcript": "hello world",
                    "words": [
                        {"word": "hello", "start": 0.1, "end": 0.4, "confidence": 0.99},
                        {"word": "world", "start": 0.5, "end": 0.9, "confidence": 0.97}
                    ]
                }]
            }
        }"#;

        let t = Transcript::from_message(body).unwrap();
        assert_eq!(t.text, "hello world");
        assert!(t.is_final);
        assert_eq!(t.words.len(), 2);
        assert_eq!(t.words[0].word, "hello");
    }

    #[test]
    fn ignores_empty_transcripts_and_other_types() {
        let empty = r#"{"type":"Results","channel":{"alternatives":[{"transcript":""}]}}"#;
        assert!(Transcript::from_message(empty).is_none());

        let metadata = r#"{"type":"Metadata","duration":1.5}"#;
        assert!(Transcript::from_message(metadata).is_none());

        let no_alternatives = r#"{"type":"Results","channel":{"alternatives":[]}}"#;
        assert!(Transcript::from_message(no_alternatives).is_none());

        assert!(Transcript::from_message("garbage").is_none());
    }

    #[test]
    fn interim_results_default_to_not_final() {
        let body = r#"{"type":"Results","channel":{"alternatives":[{"transcript":"hi"}]}}"#;
        let t = Transcript::from_message(body).unwrap();
        assert!(!t.is_final);
    }
}

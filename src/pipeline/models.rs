//! Data produced by the analyze stage.

use serde::{Deserialize, Serialize};

/// Output of speech-to-text analysis, optionally with a translation.
///
/// This is the value cached under the transcription namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Full transcript text.
    pub text: String,
    /// Timestamped segments.
    pub segments: Vec<Segment>,
    /// Language reported by the analyzer, if any.
    #[serde(default)]
    pub language: Option<String>,
    /// Translated transcript, present when a target language was requested.
    #[serde(default)]
    pub translated_text: Option<String>,
}

impl AnalysisResult {
    pub fn new(text: String, segments: Vec<Segment>) -> Self {
        Self {
            text,
            segments,
            language: None,
            translated_text: None,
        }
    }

    /// Build a result whose text is the concatenation of its segments.
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        let text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        Self::new(text, segments)
    }

    /// Total duration covered by the segments.
    pub fn duration_seconds(&self) -> f64 {
        self.segments.last().map(|s| s.end_seconds).unwrap_or(0.0)
    }
}

/// A single timestamped piece of the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub text: String,
}

impl Segment {
    pub fn new(start_seconds: f64, end_seconds: f64, text: impl Into<String>) -> Self {
        Self {
            start_seconds,
            end_seconds,
            text: text.into(),
        }
    }
}

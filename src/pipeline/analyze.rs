//! Speech-to-text via the OpenAI transcription API.

use super::{AnalysisResult, Analyzer, Segment};
use crate::error::{Result, SamleError};
use crate::openai::create_client;
use async_openai::types::{AudioInput, AudioResponseFormat, CreateTranscriptionRequestArgs};
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info, instrument};

/// Whisper-backed analyzer. The model name comes from each batch request.
pub struct WhisperAnalyzer {
    client: async_openai::Client<async_openai::config::OpenAIConfig>,
}

impl WhisperAnalyzer {
    pub fn new() -> Self {
        Self {
            client: create_client(),
        }
    }
}

impl Default for WhisperAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Analyzer for WhisperAnalyzer {
    #[instrument(skip(self), fields(input = %input.display()))]
    async fn analyze(&self, input: &Path, model: &str) -> Result<AnalysisResult> {
        debug!("Transcribing audio file");

        let file_bytes = tokio::fs::read(input).await?;
        let file_name = input
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.wav")
            .to_string();

        let request = CreateTranscriptionRequestArgs::default()
            .file(AudioInput::from_vec_u8(file_name, file_bytes))
            .model(model)
            .response_format(AudioResponseFormat::VerboseJson)
            .build()
            .map_err(|e| SamleError::Analysis(format!("Failed to build request: {}", e)))?;

        let response = self
            .client
            .audio()
            .transcribe_verbose_json(request)
            .await
            .map_err(|e| SamleError::OpenAI(format!("Transcription API error: {}", e)))?;

        let segments: Vec<Segment> = response
            .segments
            .map(|segs| {
                segs.iter()
                    .map(|s| Segment::new(s.start as f64, s.end as f64, s.text.trim()))
                    .collect()
            })
            .unwrap_or_else(|| {
                vec![Segment::new(0.0, response.duration as f64, response.text.trim())]
            });

        let mut result = AnalysisResult::new(response.text.trim().to_string(), segments);
        if !response.language.is_empty() {
            result.language = Some(response.language);
        }

        info!("Transcribed {} segments", result.segments.len());
        Ok(result)
    }
}

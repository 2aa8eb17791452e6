//! Transcript translation via OpenAI chat completions.

use super::{RetryPolicy, Translator};
use crate::error::{Result, SamleError};
use crate::openai::create_client;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use tracing::{debug, instrument};

const SYSTEM_PROMPT: &str = "You are a professional translator. Detect the source language \
automatically and translate the user's text into the requested language. Preserve line breaks. \
Reply with the translation only, without commentary.";

/// Chat-model translator with retry on transient API failures.
pub struct OpenAiTranslator {
    client: async_openai::Client<async_openai::config::OpenAIConfig>,
    model: String,
    policy: RetryPolicy,
}

impl OpenAiTranslator {
    pub fn new(model: &str, policy: RetryPolicy) -> Self {
        Self {
            client: create_client(),
            model: model.to_string(),
            policy,
        }
    }

    async fn translate_once(&self, text: &str, target_language: &str) -> Result<String> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(SYSTEM_PROMPT)
                .build()
                .map_err(|e| SamleError::Translation(e.to_string()))?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(format!("Target language: {}\n\n{}", target_language, text))
                .build()
                .map_err(|e| SamleError::Translation(e.to_string()))?
                .into(),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(0.2)
            .build()
            .map_err(|e| SamleError::Translation(e.to_string()))?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            SamleError::OpenAI(format!("Failed to translate: {}", e))
        })?;

        response
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| SamleError::Translation("Empty response from model".to_string()))
    }
}

#[async_trait]
impl Translator for OpenAiTranslator {
    #[instrument(skip(self, text), fields(target = %target_language, chars = text.len()))]
    async fn translate(&self, text: &str, target_language: &str) -> Result<String> {
        if text.trim().is_empty() {
            return Ok(String::new());
        }

        let translated = self
            .policy
            .run("translation", |_| self.translate_once(text, target_language))
            .await?;

        debug!("Translated {} chars into {} chars", text.len(), translated.len());
        Ok(translated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_text_skips_the_api() {
        let translator = OpenAiTranslator::new("gpt-4o-mini", RetryPolicy::none());
        let translated = translator.translate("   ", "de").await.unwrap();
        assert!(translated.is_empty());
    }
}

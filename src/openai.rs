//! OpenAI client shared by the analyze and translate stages.

use async_openai::{config::OpenAIConfig, Client};
use std::time::Duration;
use tracing::warn;

/// Default timeout for OpenAI API requests (5 minutes).
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Create an OpenAI client with the default request timeout.
pub fn create_client() -> Client<OpenAIConfig> {
    create_client_with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
}

/// Create an OpenAI client with a custom timeout.
///
/// Falls back to an untimed HTTP client if the TLS backend cannot be
/// initialized with the requested settings.
pub fn create_client_with_timeout(timeout: Duration) -> Client<OpenAIConfig> {
    let client = Client::with_config(OpenAIConfig::default());

    match reqwest::Client::builder().timeout(timeout).build() {
        Ok(http_client) => client.with_http_client(http_client),
        Err(e) => {
            warn!("Could not configure HTTP timeout, using defaults: {}", e);
            client
        }
    }
}

/// Whether an API key is available in the environment.
pub fn api_key_present() -> bool {
    std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.trim().is_empty())
}

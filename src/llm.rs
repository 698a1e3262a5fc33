use std::time::Duration;

use log::debug;
use serde_json::{json, Value};

use crate::config::LlmConfig;
use crate::error::EchoNotesError;

/// Synchronous text completion against a language model
///
/// Implementations may fail on network or timeout errors; callers treat any
/// error as a failed job run.
pub trait LlmClient: Send + Sync {
    fn complete(&self, prompt: &str, system_instruction: &str) -> Result<String, EchoNotesError>;
}

/// Client for servers exposing the OpenAI `/v1/chat/completions` endpoint
/// (llama.cpp, LM Studio, vLLM, ...)
pub struct HttpLlmClient {
    url: String,
    model: String,
    max_tokens: u32,
    client: reqwest::blocking::Client,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self, EchoNotesError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(HttpLlmClient {
            url: config.url.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            client,
        })
    }

    fn build_body(&self, prompt: &str, system_instruction: &str) -> Value {
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [
                { "role": "system", "content": system_instruction },
                { "role": "user", "content": prompt },
            ]
        })
    }
}

/// Pull `choices[0].message.content` out of a chat completion response
fn extract_content(response: &Value) -> Result<String, EchoNotesError> {
    response["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| {
            EchoNotesError::Llm("Response has no choices[0].message.content".to_string())
        })
}

impl LlmClient for HttpLlmClient {
    fn complete(&self, prompt: &str, system_instruction: &str) -> Result<String, EchoNotesError> {
        let body = self.build_body(prompt, system_instruction);
        debug!(
            "POST {} (model: {}, prompt: {} chars)",
            self.url,
            self.model,
            prompt.len()
        );

        let response = self.client.post(&self.url).json(&body).send()?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(EchoNotesError::Llm(format!(
                "LLM request failed with status {}: {}",
                status, text
            )));
        }

        let value: Value = response.json()?;
        extract_content(&value)
    }
}

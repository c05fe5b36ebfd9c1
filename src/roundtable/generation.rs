//! Text-generation boundary.
//!
//! The turn loop only talks to a [`Generator`]. Two implementations ship:
//! [`ChatCompletionsGenerator`] for OpenAI-compatible backends (Azure OpenAI,
//! OpenAI, self-hosted Kamiwaza) and [`EchoGenerator`], a deterministic
//! offline backend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::models::TranscriptEntry;
use super::registry::SpeakerHandle;
use crate::config::{LlmConfig, LlmProvider};
use crate::errors::GenerationError;

/// Token a backend appends to signal that the discussion should end.
pub const TERMINATE_TOKEN: &str = "TERMINATE";

/// One generated contribution.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub content: String,
    /// Display name the backend attributes the utterance to.
    pub name: String,
    /// The backend asked to end the discussion after this utterance.
    pub terminate: bool,
}

/// Per-agent model settings taken from the agent's `llm_config`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelOverrides {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ModelOverrides {
    pub fn from_llm_config(value: &serde_json::Value) -> Self {
        Self {
            model: value
                .get("model")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            temperature: value
                .get("temperature")
                .and_then(|v| v.as_f64())
                .map(|t| t as f32),
            max_tokens: value
                .get("max_tokens")
                .and_then(|v| v.as_u64())
                .and_then(|t| u32::try_from(t).ok()),
        }
    }
}

/// Capability the turn loop needs from a text-generation backend.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce the next utterance for `speaker` given the ordered transcript.
    async fn generate(
        &self,
        speaker: &SpeakerHandle,
        system_prompt: &str,
        transcript: &[TranscriptEntry],
    ) -> Result<Utterance, GenerationError>;

    /// Pick who speaks next from `eligible`. `None` means no preference.
    async fn select_next_speaker(
        &self,
        transcript: &[TranscriptEntry],
        eligible: &[&SpeakerHandle],
    ) -> Result<Option<String>, GenerationError>;
}

/// Build the backend selected by configuration.
pub fn build_generator(config: &LlmConfig) -> Result<Arc<dyn Generator>> {
    match config.provider {
        LlmProvider::Echo => Ok(Arc::new(EchoGenerator)),
        _ => Ok(Arc::new(ChatCompletionsGenerator::new(config)?)),
    }
}

/// Strip a trailing termination token, reporting whether one was present.
pub fn split_termination(content: &str) -> (String, bool) {
    let trimmed = content.trim_end();
    match trimmed.strip_suffix(TERMINATE_TOKEN) {
        Some(rest) => (rest.trim_end().to_string(), true),
        None => (trimmed.to_string(), false),
    }
}

// ── OpenAI-compatible chat completions ────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct ChatMessage {
    role: String,
    content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Map the shared transcript into a chat request from `speaker`'s point of view.
///
/// The speaker's own earlier contributions become `assistant` turns; every
/// other participant's contribution becomes a `user` turn prefixed with the
/// speaker's name.
fn chat_messages(
    speaker: &SpeakerHandle,
    system_prompt: &str,
    transcript: &[TranscriptEntry],
) -> Vec<ChatMessage> {
    let mut system = system_prompt.to_string();
    if !speaker.system_prompt.is_empty() {
        system.push_str("\n\n");
        system.push_str(&speaker.system_prompt);
    }
    let mut messages = vec![ChatMessage::new("system", system)];
    for entry in transcript {
        if entry.role == "system" {
            messages.push(ChatMessage::new("system", entry.content.clone()));
        } else if entry.name == speaker.display_name {
            messages.push(ChatMessage::new("assistant", entry.content.clone()));
        } else {
            messages.push(ChatMessage::new(
                "user",
                format!("{}: {}", entry.name, entry.content),
            ));
        }
    }
    messages
}

fn selection_messages(
    transcript: &[TranscriptEntry],
    eligible: &[&SpeakerHandle],
) -> Vec<ChatMessage> {
    let roles: Vec<String> = eligible
        .iter()
        .map(|s| format!("{}: {}", s.display_name, s.title))
        .collect();
    let names: Vec<&str> = eligible.iter().map(|s| s.display_name.as_str()).collect();
    let mut messages = vec![ChatMessage::new(
        "system",
        format!(
            "You are in a role play game. The following roles are available:\n{}\n\nRead the following conversation. Then select the next role from {:?} to play. Only return the role.",
            roles.join("\n"),
            names
        ),
    )];
    for entry in transcript.iter().filter(|e| e.role != "system") {
        messages.push(ChatMessage::new(
            "user",
            format!("{}: {}", entry.name, entry.content),
        ));
    }
    messages.push(ChatMessage::new(
        "user",
        format!(
            "Read the above conversation. Then select the next role from {:?} to play. Only return the role.",
            names
        ),
    ));
    messages
}

/// Resolve a free-text reply to one of the eligible display names.
///
/// An exact match wins; otherwise the earliest name mentioned in the reply.
fn match_speaker_name(reply: &str, eligible: &[&SpeakerHandle]) -> Option<String> {
    let reply = reply.trim().trim_matches(|c: char| c == '"' || c == '\'' || c == '.');
    if let Some(exact) = eligible.iter().find(|s| s.display_name == reply) {
        return Some(exact.display_name.clone());
    }
    eligible
        .iter()
        .filter_map(|s| reply.find(&s.display_name).map(|pos| (pos, s)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, s)| s.display_name.clone())
}

pub struct ChatCompletionsGenerator {
    http: reqwest::Client,
    provider: LlmProvider,
    base_url: String,
    api_key: Option<String>,
    api_version: String,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
}

impl ChatCompletionsGenerator {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        config.validate()?;
        let base_url = match (&config.provider, &config.endpoint) {
            (_, Some(endpoint)) => endpoint.trim_end_matches('/').to_string(),
            (LlmProvider::OpenAi, None) => "https://api.openai.com/v1".to_string(),
            (provider, None) => anyhow::bail!("No endpoint configured for provider {}", provider),
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            provider: config.provider,
            base_url,
            api_key: config.api_key.clone(),
            api_version: config.api_version.clone(),
            model: config.model_name(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    fn url_for(&self, model: &str) -> String {
        match self.provider {
            LlmProvider::Azure => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.base_url, model, self.api_version
            ),
            _ => format!("{}/chat/completions", self.base_url),
        }
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<String, GenerationError> {
        let request = ChatRequest {
            model,
            messages,
            temperature,
            max_tokens,
        };
        let mut builder = self.http.post(self.url_for(model)).json(&request);
        builder = match (self.provider, &self.api_key) {
            (LlmProvider::Azure, Some(key)) => builder.header("api-key", key),
            (LlmProvider::OpenAi, Some(key)) => builder.bearer_auth(key),
            _ => builder,
        };

        debug!(model, messages = messages.len(), "sending chat completion request");
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Backend {
                status: status.as_u16(),
                body,
            });
        }
        let body = response.text().await?;
        let parsed: ChatResponse =
            serde_json::from_str(&body).map_err(|e| GenerationError::Decode(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(content)
    }
}

#[async_trait]
impl Generator for ChatCompletionsGenerator {
    async fn generate(
        &self,
        speaker: &SpeakerHandle,
        system_prompt: &str,
        transcript: &[TranscriptEntry],
    ) -> Result<Utterance, GenerationError> {
        let messages = chat_messages(speaker, system_prompt, transcript);
        let model = speaker.overrides.model.as_deref().unwrap_or(&self.model);
        let temperature = speaker.overrides.temperature.unwrap_or(self.temperature);
        let max_tokens = speaker.overrides.max_tokens.or(self.max_tokens);
        let raw = self
            .complete(model, &messages, temperature, max_tokens)
            .await?;
        let (content, terminate) = split_termination(&raw);
        // A bare termination token is kept as the message text.
        let content = if content.is_empty() {
            raw.trim().to_string()
        } else {
            content
        };
        Ok(Utterance {
            content,
            name: speaker.display_name.clone(),
            terminate,
        })
    }

    async fn select_next_speaker(
        &self,
        transcript: &[TranscriptEntry],
        eligible: &[&SpeakerHandle],
    ) -> Result<Option<String>, GenerationError> {
        if eligible.len() < 2 {
            return Ok(eligible.first().map(|s| s.display_name.clone()));
        }
        let messages = selection_messages(transcript, eligible);
        let reply = self
            .complete(&self.model, &messages, 0.0, Some(20))
            .await?;
        Ok(match_speaker_name(&reply, eligible))
    }
}

// ── Offline backend ───────────────────────────────────────────────────

/// Deterministic backend that answers without any network access.
pub struct EchoGenerator;

fn excerpt(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    let mut out: String = line.chars().take(max_chars).collect();
    if line.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(
        &self,
        speaker: &SpeakerHandle,
        _system_prompt: &str,
        transcript: &[TranscriptEntry],
    ) -> Result<Utterance, GenerationError> {
        let content = match transcript.iter().rev().find(|e| e.role != "system") {
            Some(last) => format!(
                "{} ({}) responding to {}: {}",
                speaker.display_name,
                speaker.title,
                last.name,
                excerpt(&last.content, 60)
            ),
            None => format!("{} ({}) opens the discussion.", speaker.display_name, speaker.title),
        };
        Ok(Utterance {
            content,
            name: speaker.display_name.clone(),
            terminate: false,
        })
    }

    async fn select_next_speaker(
        &self,
        _transcript: &[TranscriptEntry],
        _eligible: &[&SpeakerHandle],
    ) -> Result<Option<String>, GenerationError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::post};
    use std::sync::Mutex;
    use uuid::Uuid;

    fn speaker(name: &str) -> SpeakerHandle {
        SpeakerHandle {
            agent_id: Uuid::new_v4(),
            display_name: name.to_string(),
            title: "Panelist".to_string(),
            system_prompt: format!("You are {}.", name),
            role: None,
            priority: 1,
            overrides: ModelOverrides::default(),
        }
    }

    #[test]
    fn test_split_termination() {
        assert_eq!(
            split_termination("We agree. TERMINATE"),
            ("We agree.".to_string(), true)
        );
        assert_eq!(
            split_termination("TERMINATE\n"),
            (String::new(), true)
        );
        assert_eq!(
            split_termination("Keep going  "),
            ("Keep going".to_string(), false)
        );
    }

    #[test]
    fn test_model_overrides_from_llm_config() {
        let overrides = ModelOverrides::from_llm_config(&serde_json::json!({
            "model": "gpt-4o-mini",
            "temperature": 0.3,
            "max_tokens": 256,
        }));
        assert_eq!(overrides.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(overrides.temperature, Some(0.3));
        assert_eq!(overrides.max_tokens, Some(256));
        assert_eq!(
            ModelOverrides::from_llm_config(&serde_json::json!({})),
            ModelOverrides::default()
        );
    }

    #[test]
    fn test_oversized_max_tokens_is_ignored() {
        let overrides = ModelOverrides::from_llm_config(&serde_json::json!({
            "max_tokens": u64::from(u32::MAX) + 1,
        }));
        assert_eq!(overrides.max_tokens, None);
    }

    #[test]
    fn test_chat_messages_map_roles_per_speaker() {
        let ada = speaker("Ada");
        let transcript = vec![
            TranscriptEntry::assistant("Grace", "Opening"),
            TranscriptEntry::assistant("Ada", "My view"),
        ];
        let messages = chat_messages(&ada, "Frame", &transcript);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.starts_with("Frame"));
        assert!(messages[0].content.contains("You are Ada."));
        assert_eq!(messages[1], ChatMessage::new("user", "Grace: Opening"));
        assert_eq!(messages[2], ChatMessage::new("assistant", "My view"));
    }

    #[test]
    fn test_match_speaker_name() {
        let ada = speaker("Ada");
        let grace = speaker("Grace");
        let eligible = vec![&ada, &grace];
        assert_eq!(match_speaker_name("Grace", &eligible).as_deref(), Some("Grace"));
        assert_eq!(
            match_speaker_name("I think Ada should go, then Grace.", &eligible).as_deref(),
            Some("Ada")
        );
        assert_eq!(match_speaker_name("\"Grace\"", &eligible).as_deref(), Some("Grace"));
        assert!(match_speaker_name("Nobody", &eligible).is_none());
    }

    #[tokio::test]
    async fn test_echo_generator_is_deterministic() {
        let ada = speaker("Ada");
        let transcript = vec![TranscriptEntry::assistant("Grace", "Shall we begin?")];
        let first = EchoGenerator.generate(&ada, "", &transcript).await.unwrap();
        let second = EchoGenerator.generate(&ada, "", &transcript).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.name, "Ada");
        assert!(first.content.contains("Grace"));
        assert!(!first.terminate);
    }

    #[test]
    fn test_build_generator_requires_credentials() {
        let config = LlmConfig {
            provider: LlmProvider::OpenAi,
            ..Default::default()
        };
        assert!(build_generator(&config).is_err());
        assert!(build_generator(&LlmConfig::default()).is_ok());
    }

    async fn spawn_backend(reply: &'static str) -> (String, Arc<Mutex<Vec<serde_json::Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move |Json(body): Json<serde_json::Value>| {
                let recorded = recorded.clone();
                async move {
                    recorded.lock().unwrap().push(body);
                    Json(serde_json::json!({
                        "choices": [{"message": {"role": "assistant", "content": reply}}]
                    }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/v1", addr), seen)
    }

    fn local_config(endpoint: String) -> LlmConfig {
        LlmConfig {
            provider: LlmProvider::Kamiwaza,
            model: Some("local-model".into()),
            endpoint: Some(endpoint),
            max_tokens: Some(150),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_chat_generator_against_local_backend() {
        let (endpoint, seen) = spawn_backend("Let us wrap up. TERMINATE").await;
        let generator = ChatCompletionsGenerator::new(&local_config(endpoint)).unwrap();
        let mut ada = speaker("Ada");
        ada.overrides.temperature = Some(0.1);

        let transcript = vec![TranscriptEntry::assistant("Grace", "Opening")];
        let utterance = generator.generate(&ada, "Frame", &transcript).await.unwrap();
        assert_eq!(utterance.content, "Let us wrap up.");
        assert!(utterance.terminate);
        assert_eq!(utterance.name, "Ada");

        let requests = seen.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["model"], "local-model");
        assert_eq!(requests[0]["max_tokens"], 150);
        let temperature = requests[0]["temperature"].as_f64().unwrap();
        assert!((temperature - 0.1).abs() < 1e-6);
        assert_eq!(requests[0]["messages"][1]["role"], "user");
    }

    #[tokio::test]
    async fn test_chat_generator_selects_speaker_from_reply() {
        let (endpoint, _seen) = spawn_backend("Grace").await;
        let generator = ChatCompletionsGenerator::new(&local_config(endpoint)).unwrap();
        let ada = speaker("Ada");
        let grace = speaker("Grace");
        let choice = generator
            .select_next_speaker(&[], &[&ada, &grace])
            .await
            .unwrap();
        assert_eq!(choice.as_deref(), Some("Grace"));
    }

    #[tokio::test]
    async fn test_chat_generator_reports_backend_errors() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let generator =
            ChatCompletionsGenerator::new(&local_config(format!("http://{}/v1", addr))).unwrap();
        let err = generator
            .generate(&speaker("Ada"), "", &[])
            .await
            .unwrap_err();
        match err {
            GenerationError::Backend { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("Expected Backend error, got {:?}", other),
        }
    }
}

use crate::domain::models::{SUGGESTIONS_PER_TASK, Suggestion, Task};
use crate::infrastructure::config::OpenAiSettings;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

const TEMPERATURE: f32 = 0.7;
const MAX_TOKENS: u32 = 600;

#[async_trait]
pub trait SuggestionGenerator: Send + Sync {
    /// Exactly `SUGGESTIONS_PER_TASK` title proposals for `task`.
    async fn generate(&self, task: &Task, context: &str) -> Result<Vec<Suggestion>, InfraError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiSuggestionClient {
    client: Client,
    settings: OpenAiSettings,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SuggestionsPayload {
    #[serde(default)]
    suggestions: Vec<SuggestionPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SuggestionPayload {
    #[serde(default)]
    new_title: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    estimated_duration: f64,
}

impl OpenAiSuggestionClient {
    pub fn new(settings: OpenAiSettings) -> Self {
        Self {
            client: Client::new(),
            settings,
        }
    }

    fn api_key(&self) -> Result<&str, InfraError> {
        self.settings
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| InfraError::Auth("OPENAI_API_KEY is not configured".to_string()))
    }

    fn completions_endpoint(&self) -> Result<Url, InfraError> {
        let mut url = Url::parse(&self.settings.base_url)
            .map_err(|error| InfraError::Suggestion(format!("invalid openai base url: {error}")))?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InfraError::Suggestion("openai base URL cannot be a base".to_string())
            })?;
            segments.pop_if_empty();
            segments.push("chat");
            segments.push("completions");
        }
        Ok(url)
    }

    fn http_error(status: StatusCode, body: &str) -> InfraError {
        let message = format!("openai api error: http {}; body={body}", status.as_u16());
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => InfraError::Auth(message),
            _ => InfraError::Suggestion(message),
        }
    }
}

#[async_trait]
impl SuggestionGenerator for OpenAiSuggestionClient {
    async fn generate(&self, task: &Task, context: &str) -> Result<Vec<Suggestion>, InfraError> {
        let api_key = self.api_key()?;
        let prompt = build_task_prompt(&self.settings.task_prompt, task, context);
        let request = ChatRequest {
            model: &self.settings.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.settings.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let response = self
            .client
            .post(self.completions_endpoint()?)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|error| {
                InfraError::Suggestion(format!("network error while requesting suggestions: {error}"))
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|error| {
            InfraError::Suggestion(format!("failed reading completion response: {error}"))
        })?;
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }

        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|error| {
            InfraError::Suggestion(format!("invalid completion payload: {error}; body={body}"))
        })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| InfraError::Suggestion("completion contained no message".to_string()))?;

        tracing::debug!(task_id = %task.id, model = %self.settings.model, "received suggestions");
        parse_suggestions(&content)
    }
}

fn build_task_prompt(task_prompt: &str, task: &Task, context: &str) -> String {
    format!(
        "{task_prompt}\n\n\
         Task to improve:\n\"{content}\"\n\n\
         Context, all my other tasks and today's appointments:\n{context}\n\n\
         Answer ONLY with a JSON object of this shape, containing exactly {count} suggestions:\n\
         {{\"suggestions\":[{{\"newTitle\":\"<string>\",\"reason\":\"<string>\",\"estimatedDuration\":<minutes>}}]}}",
        content = task.content,
        count = SUGGESTIONS_PER_TASK,
    )
}

/// Keeps the first five usable suggestions; fewer is an error.
fn parse_suggestions(content: &str) -> Result<Vec<Suggestion>, InfraError> {
    let payload: SuggestionsPayload = serde_json::from_str(content).map_err(|error| {
        InfraError::Suggestion(format!("suggestion content is not valid JSON: {error}; content={content}"))
    })?;

    let suggestions = payload
        .suggestions
        .into_iter()
        .filter(|suggestion| !suggestion.new_title.trim().is_empty())
        .take(SUGGESTIONS_PER_TASK)
        .map(|suggestion| Suggestion {
            new_title: suggestion.new_title.trim().to_string(),
            reason: suggestion.reason.trim().to_string(),
            estimated_duration_minutes: suggestion.estimated_duration.round().max(0.0) as u32,
        })
        .collect::<Vec<_>>();

    if suggestions.len() < SUGGESTIONS_PER_TASK {
        return Err(InfraError::Suggestion(format!(
            "expected {SUGGESTIONS_PER_TASK} suggestions, got {}",
            suggestions.len()
        )));
    }
    Ok(suggestions)
}

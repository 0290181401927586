use crate::domain::models::Task;
use crate::infrastructure::config::TodoistSettings;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use url::Url;

#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn fetch_tasks(&self) -> Result<Vec<Task>, InfraError>;
    async fn update_task_title(&self, task_id: &str, new_title: &str) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct TodoistClient {
    client: Client,
    settings: TodoistSettings,
}

#[derive(Debug, serde::Deserialize)]
struct TodoistDue {
    date: String,
    datetime: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct TodoistTaskPayload {
    id: String,
    content: String,
    due: Option<TodoistDue>,
    #[serde(default = "default_priority")]
    priority: u8,
    #[serde(default)]
    project_id: String,
}

#[derive(Debug, serde::Serialize)]
struct UpdateTaskRequest<'a> {
    content: &'a str,
}

fn default_priority() -> u8 {
    1
}

impl TodoistClient {
    pub fn new(settings: TodoistSettings) -> Self {
        Self {
            client: Client::new(),
            settings,
        }
    }

    fn api_token(&self) -> Result<&str, InfraError> {
        self.settings
            .api_token
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| InfraError::Auth("TODOIST_API_TOKEN is not configured".to_string()))
    }

    fn ensure_non_empty(value: &str, field: &str) -> Result<(), InfraError> {
        if value.trim().is_empty() {
            return Err(InfraError::TaskSource(format!("{field} must not be empty")));
        }
        Ok(())
    }

    fn http_error(status: StatusCode, body: &str) -> InfraError {
        let message = if body.trim().is_empty() {
            format!("todoist api error: http {}", status.as_u16())
        } else {
            format!("todoist api error: http {}; body={body}", status.as_u16())
        };
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => InfraError::Auth(message),
            StatusCode::NOT_FOUND => InfraError::NotFound(message),
            _ => InfraError::TaskSource(message),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, InfraError> {
        let mut url = Url::parse(&self.settings.base_url)
            .map_err(|error| InfraError::TaskSource(format!("invalid todoist base url: {error}")))?;
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                InfraError::TaskSource("todoist base URL cannot be a base".to_string())
            })?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }
}

#[async_trait]
impl TaskSource for TodoistClient {
    async fn fetch_tasks(&self) -> Result<Vec<Task>, InfraError> {
        let api_token = self.api_token()?;
        let mut request = self
            .client
            .get(self.endpoint(&["tasks"])?)
            .bearer_auth(api_token);
        if let Some(project_id) = self.settings.project_id.as_deref() {
            request = request.query(&[("project_id", project_id)]);
        }

        let response = request.send().await.map_err(|error| {
            InfraError::TaskSource(format!("network error while listing tasks: {error}"))
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|error| {
            InfraError::TaskSource(format!("failed reading task list response: {error}"))
        })?;
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }

        let tasks = parse_tasks(&body)?;
        tracing::debug!(count = tasks.len(), "loaded tasks from todoist");
        Ok(tasks)
    }

    async fn update_task_title(&self, task_id: &str, new_title: &str) -> Result<(), InfraError> {
        Self::ensure_non_empty(task_id, "task id")?;
        Self::ensure_non_empty(new_title, "new title")?;
        let api_token = self.api_token()?;

        let response = self
            .client
            .post(self.endpoint(&["tasks", task_id.trim()])?)
            .bearer_auth(api_token)
            .json(&UpdateTaskRequest {
                content: new_title.trim(),
            })
            .send()
            .await
            .map_err(|error| {
                InfraError::TaskSource(format!("network error while updating task: {error}"))
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|error| {
            InfraError::TaskSource(format!("failed reading task update response: {error}"))
        })?;
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        Ok(())
    }
}

fn parse_tasks(body: &str) -> Result<Vec<Task>, InfraError> {
    let payloads: Vec<TodoistTaskPayload> = serde_json::from_str(body).map_err(|error| {
        InfraError::TaskSource(format!("invalid task list payload: {error}; body={body}"))
    })?;
    Ok(payloads
        .into_iter()
        .filter_map(|payload| {
            let task_id = payload.id.clone();
            map_task(payload)
                .inspect_err(|error| tracing::warn!(%task_id, %error, "skipping malformed todoist task"))
                .ok()
        })
        .collect())
}

fn map_task(payload: TodoistTaskPayload) -> Result<Task, InfraError> {
    let due_date = payload
        .due
        .as_ref()
        .map(|due| parse_due_date(&due.date))
        .transpose()?;
    let task = Task {
        id: payload.id,
        content: payload.content,
        due_date,
        due_datetime: payload.due.and_then(|due| due.datetime),
        priority: payload.priority,
        project_id: payload.project_id,
        optimized: false,
    };
    task.validate().map_err(InfraError::TaskSource)?;
    Ok(task)
}

/// Accepts both `YYYY-MM-DD` and full timestamps; only the calendar date is kept.
fn parse_due_date(value: &str) -> Result<NaiveDate, InfraError> {
    value
        .get(..10)
        .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
        .ok_or_else(|| InfraError::TaskSource(format!("invalid due date: {value}")))
}

use crate::application::aggregator::{AggregationRequest, DashboardAggregator};
use crate::application::bootstrap::bootstrap_workspace;
use crate::application::progress::{DashboardEvent, ProgressHub, ProgressSink};
use crate::domain::models::{AggregationStage, DashboardSnapshot};
use crate::infrastructure::config::EnvLookup;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::graph_calendar_client::GraphCalendarClient;
use crate::infrastructure::openai_client::OpenAiSuggestionClient;
use crate::infrastructure::suggestion_store::SqliteSuggestionStore;
use crate::infrastructure::todoist_client::{TaskSource, TodoistClient};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

type LiveAggregator = DashboardAggregator<
    GraphCalendarClient,
    TodoistClient,
    OpenAiSuggestionClient,
    SqliteSuggestionStore,
>;

pub struct AppState {
    config_dir: PathBuf,
    database_path: PathBuf,
    logs_dir: PathBuf,
    listen_addr: String,
    aggregator: LiveAggregator,
    tasks: Arc<TodoistClient>,
    hub: ProgressHub,
    log_guard: Mutex<()>,
}

impl AppState {
    pub fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        Self::with_env(workspace_root, &|key| std::env::var(key).ok())
    }

    pub fn with_env(workspace_root: PathBuf, lookup: EnvLookup<'_>) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root, lookup)?;
        let config = bootstrap.config;
        tracing::info!(
            app = %config.app_name,
            listen_addr = %config.listen_addr,
            timezone = %config.dashboard.schedule.timezone.name(),
            "configuration loaded"
        );

        let tasks = Arc::new(TodoistClient::new(config.todoist));
        let aggregator = DashboardAggregator::new(
            Arc::new(GraphCalendarClient::new(config.graph)),
            tasks.clone(),
            Arc::new(OpenAiSuggestionClient::new(config.openai)),
            Arc::new(SqliteSuggestionStore::new(&bootstrap.database_path)),
            config.dashboard,
        );

        Ok(Self {
            config_dir: bootstrap.config_dir,
            database_path: bootstrap.database_path,
            logs_dir: bootstrap.logs_dir,
            listen_addr: config.listen_addr,
            aggregator,
            tasks,
            hub: ProgressHub::default(),
            log_guard: Mutex::new(()),
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    pub fn hub(&self) -> &ProgressHub {
        &self.hub
    }

    pub fn command_error(&self, command: &str, error: &InfraError) -> String {
        self.log_error(command, &error.to_string());
        error.to_string()
    }

    pub fn log_info(&self, command: &str, message: &str) {
        self.append_log("info", command, message);
    }

    pub fn log_error(&self, command: &str, message: &str) {
        self.append_log("error", command, message);
    }

    /// Appends one JSON line to `logs/commands.log` and mirrors it to live log subscribers.
    fn append_log(&self, level: &str, command: &str, message: &str) {
        self.hub.log(level, format!("[{command}] {message}"));

        let Ok(_guard) = self.log_guard.lock() else {
            return;
        };
        let path = self.logs_dir.join("commands.log");
        let payload = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": level,
            "command": command,
            "message": message,
        });

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", payload);
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContextResponse {
    pub context: String,
    pub last_context_update: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskResponse {
    pub success: bool,
    pub task_id: String,
}

pub async fn get_dashboard_impl(
    state: &AppState,
    date: Option<String>,
    force: bool,
    sink: &dyn ProgressSink,
) -> Result<DashboardSnapshot, InfraError> {
    let started_at = Instant::now();
    let date = date
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(parse_date_input)
        .transpose()
        .inspect_err(|error| {
            sink.emit(DashboardEvent::Failed {
                stage: AggregationStage::Error,
                reason: error.to_string(),
            })
        })?;

    let snapshot = state
        .aggregator
        .aggregate(
            AggregationRequest {
                date,
                force_update: force,
            },
            sink,
        )
        .await?;

    let message = format!(
        "date={} force={force} free_hours={} overdue={} due_today={} suggestions={} elapsed_ms={}",
        snapshot.date,
        snapshot.total_free_hours,
        snapshot.overdue_tasks.len(),
        snapshot.due_today_tasks.len(),
        snapshot.task_suggestions.len(),
        started_at.elapsed().as_millis()
    );
    match snapshot.error.as_deref() {
        Some(error) => state.log_error("get_dashboard", &format!("{message} partial: {error}")),
        None => state.log_info("get_dashboard", &message),
    }
    Ok(snapshot)
}

pub fn get_context_impl(state: &AppState) -> Result<ContextResponse, InfraError> {
    let (context, last_context_update) = state.aggregator.context()?;
    state.log_info("get_context", &format!("context_chars={}", context.chars().count()));
    Ok(ContextResponse {
        context,
        last_context_update,
        timestamp: state.aggregator.now(),
    })
}

/// Renames the task at the task source and stops suggesting titles for it.
pub async fn update_task_title_impl(
    state: &AppState,
    task_id: String,
    new_title: String,
) -> Result<UpdateTaskResponse, InfraError> {
    let task_id = task_id.trim().to_string();
    let new_title = new_title.trim().to_string();
    if task_id.is_empty() {
        return Err(InfraError::InvalidConfig("taskId must not be empty".to_string()));
    }
    if new_title.is_empty() {
        return Err(InfraError::InvalidConfig("newTitle must not be empty".to_string()));
    }

    state.tasks.update_task_title(&task_id, &new_title).await?;
    state.aggregator.cache().mark_optimized(&task_id);
    state.log_info("update_task_title", &format!("renamed task_id={task_id}"));

    Ok(UpdateTaskResponse {
        success: true,
        task_id,
    })
}

/// Fallback snapshot for a failed dashboard command.
pub fn failed_snapshot(state: &AppState, date: Option<&str>, message: String) -> DashboardSnapshot {
    let date = date
        .and_then(|value| NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok())
        .unwrap_or_else(|| state.aggregator.today());
    DashboardSnapshot::failed(date, state.aggregator.now(), message)
}

fn parse_date_input(value: &str) -> Result<NaiveDate, InfraError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|error| InfraError::InvalidConfig(format!("date must be YYYY-MM-DD: {error}")))
}

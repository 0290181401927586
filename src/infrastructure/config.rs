use crate::domain::models::WorkSchedule;
use crate::infrastructure::error::InfraError;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const APP_JSON: &str = "app.json";
const INTEGRATIONS_JSON: &str = "integrations.json";
const SUPPORTED_SCHEMA: u64 = 1;

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a productivity assistant. You rewrite vague to-do items into concrete, actionable task titles.";
pub const DEFAULT_TASK_PROMPT: &str = "Suggest five alternative titles for the task below. Each title should start with a verb and describe a single finishable step.";

/// Reads one environment variable; injected so tests never touch the real process environment.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardConfig {
    pub schedule: WorkSchedule,
    pub days_to_include: u32,
    pub context_refresh_interval_ms: u64,
    pub suggestion_delay_ms: u64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            schedule: WorkSchedule::default(),
            days_to_include: 1,
            context_refresh_interval_ms: 5 * 60 * 1000,
            suggestion_delay_ms: 500,
        }
    }
}

impl DashboardConfig {
    pub fn validate(&self) -> Result<(), InfraError> {
        self.schedule.validate().map_err(InfraError::InvalidConfig)?;
        if self.days_to_include == 0 {
            return Err(InfraError::InvalidConfig(
                "daysToInclude must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphSettings {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub user_email: Option<String>,
    pub graph_base_url: String,
    pub authority_base_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoistSettings {
    pub api_token: Option<String>,
    pub base_url: String,
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAiSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub system_prompt: String,
    pub task_prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub app_name: String,
    pub listen_addr: String,
    pub dashboard: DashboardConfig,
    pub graph: GraphSettings,
    pub todoist: TodoistSettings,
    pub openai: OpenAiSettings,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppFile {
    schema: u64,
    app_name: String,
    listen_addr: String,
    timezone: String,
    work_start_hour: u32,
    work_end_hour: u32,
    days_to_include: u32,
    context_refresh_interval_ms: u64,
    suggestion_delay_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntegrationsFile {
    schema: u64,
    graph: GraphFile,
    todoist: TodoistFile,
    openai: OpenAiFile,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFile {
    tenant_id: Option<String>,
    client_id: Option<String>,
    user_email: Option<String>,
    graph_base_url: String,
    authority_base_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TodoistFile {
    base_url: String,
    project_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenAiFile {
    base_url: String,
    model: String,
    system_prompt: String,
    task_prompt: String,
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "appName": "timecraft",
                "listenAddr": "127.0.0.1:3000",
                "timezone": "UTC",
                "workStartHour": 9,
                "workEndHour": 17,
                "daysToInclude": 1,
                "contextRefreshIntervalMs": 300000,
                "suggestionDelayMs": 500
            }),
        ),
        (
            INTEGRATIONS_JSON,
            serde_json::json!({
                "schema": 1,
                "graph": {
                    "tenantId": null,
                    "clientId": null,
                    "userEmail": null,
                    "graphBaseUrl": "https://graph.microsoft.com/v1.0",
                    "authorityBaseUrl": "https://login.microsoftonline.com"
                },
                "todoist": {
                    "baseUrl": "https://api.todoist.com/rest/v2",
                    "projectId": null
                },
                "openai": {
                    "baseUrl": "https://api.openai.com/v1",
                    "model": DEFAULT_OPENAI_MODEL,
                    "systemPrompt": DEFAULT_SYSTEM_PROMPT,
                    "taskPrompt": DEFAULT_TASK_PROMPT
                }
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != SUPPORTED_SCHEMA {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

fn read_typed<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, InfraError> {
    let value = read_config(path)?;
    serde_json::from_value(value)
        .map_err(|error| InfraError::InvalidConfig(format!("{}: {error}", path.display())))
}

/// Loads `config/*.json` and applies environment overrides on top.
///
/// Secrets are never read from disk. Any invalid value fails the whole load.
pub fn load_app_config(config_dir: &Path, lookup: EnvLookup<'_>) -> Result<AppConfig, InfraError> {
    let app: AppFile = read_typed(&config_dir.join(APP_JSON))?;
    let integrations: IntegrationsFile = read_typed(&config_dir.join(INTEGRATIONS_JSON))?;

    let timezone_name = env_string(lookup, "TIMEZONE").unwrap_or(app.timezone);
    let timezone = parse_timezone(&timezone_name)?;
    let dashboard = DashboardConfig {
        schedule: WorkSchedule {
            work_start_hour: env_parsed(lookup, "WORK_BEGIN")?.unwrap_or(app.work_start_hour),
            work_end_hour: env_parsed(lookup, "WORK_END")?.unwrap_or(app.work_end_hour),
            timezone,
        },
        days_to_include: env_parsed(lookup, "DAYS_TO_INCLUDE")?.unwrap_or(app.days_to_include),
        context_refresh_interval_ms: env_parsed(lookup, "CONTEXT_REFRESH_INTERVAL_MS")?
            .unwrap_or(app.context_refresh_interval_ms),
        suggestion_delay_ms: env_parsed(lookup, "SUGGESTION_DELAY_MS")?
            .unwrap_or(app.suggestion_delay_ms),
    };
    dashboard.validate()?;

    Ok(AppConfig {
        app_name: app.app_name,
        listen_addr: env_string(lookup, "LISTEN_ADDR").unwrap_or(app.listen_addr),
        dashboard,
        graph: GraphSettings {
            tenant_id: env_string(lookup, "MICROSOFT_TENANT_ID").or(integrations.graph.tenant_id),
            client_id: env_string(lookup, "MICROSOFT_CLIENT_ID").or(integrations.graph.client_id),
            client_secret: env_string(lookup, "MICROSOFT_CLIENT_SECRET"),
            user_email: env_string(lookup, "MS_USER_EMAIL").or(integrations.graph.user_email),
            graph_base_url: integrations.graph.graph_base_url,
            authority_base_url: integrations.graph.authority_base_url,
        },
        todoist: TodoistSettings {
            api_token: env_string(lookup, "TODOIST_API_TOKEN"),
            base_url: integrations.todoist.base_url,
            project_id: env_string(lookup, "TODOIST_PROJECT_ID").or(integrations.todoist.project_id),
        },
        openai: OpenAiSettings {
            api_key: env_string(lookup, "OPENAI_API_KEY"),
            base_url: integrations.openai.base_url,
            model: env_string(lookup, "OPENAI_MODEL").unwrap_or(integrations.openai.model),
            system_prompt: env_string(lookup, "OPENAI_SYSTEM_PROMPT")
                .unwrap_or(integrations.openai.system_prompt),
            task_prompt: env_string(lookup, "OPENAI_TASK_PROMPT")
                .unwrap_or(integrations.openai.task_prompt),
        },
    })
}

pub fn parse_timezone(value: &str) -> Result<Tz, InfraError> {
    value
        .trim()
        .parse::<Tz>()
        .map_err(|_| InfraError::InvalidConfig(format!("unknown timezone: {value}")))
}

fn env_string(lookup: EnvLookup<'_>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(lookup: EnvLookup<'_>, key: &str) -> Result<Option<T>, InfraError> {
    match env_string(lookup, key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| InfraError::InvalidConfig(format!("{key} has invalid value: {raw}"))),
        None => Ok(None),
    }
}

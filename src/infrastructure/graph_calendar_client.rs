use crate::domain::models::CalendarEvent;
use crate::infrastructure::config::GraphSettings;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use std::sync::Mutex;
use url::Url;

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
const PAGE_SIZE: &str = "100";
const TOKEN_EXPIRY_MARGIN_SECONDS: i64 = 60;

#[async_trait]
pub trait CalendarSource: Send + Sync {
    /// Events intersecting `[start, end)`, in UTC.
    async fn fetch_events(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, InfraError>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Microsoft Graph calendar reader using the client-credentials grant.
#[derive(Debug)]
pub struct GraphCalendarClient {
    client: Client,
    settings: GraphSettings,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Debug, serde::Deserialize)]
struct TokenResponsePayload {
    access_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct GraphDateTime {
    #[serde(rename = "dateTime")]
    date_time: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct GraphEvent {
    subject: Option<String>,
    start: GraphDateTime,
    end: GraphDateTime,
    #[serde(rename = "isCancelled", default)]
    is_cancelled: bool,
    #[serde(rename = "isAllDay", default)]
    is_all_day: bool,
    #[serde(rename = "showAs")]
    show_as: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct CalendarViewPage {
    #[serde(default)]
    value: Vec<GraphEvent>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

impl GraphCalendarClient {
    pub fn new(settings: GraphSettings) -> Self {
        Self {
            client: Client::new(),
            settings,
            token: Mutex::new(None),
        }
    }

    fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, InfraError> {
        value
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| InfraError::Auth(format!("{name} is not configured")))
    }

    fn http_error(status: StatusCode, body: &str, user_email: &str) -> InfraError {
        match status {
            StatusCode::NOT_FOUND => {
                InfraError::NotFound(format!("calendar not found for user {user_email}"))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => InfraError::Auth(format!(
                "graph api denied calendar access for {user_email}: http {}",
                status.as_u16()
            )),
            _ if body.trim().is_empty() => {
                InfraError::Calendar(format!("graph api error: http {}", status.as_u16()))
            }
            _ => InfraError::Calendar(format!(
                "graph api error: http {}; body={body}",
                status.as_u16()
            )),
        }
    }

    fn token_endpoint(&self, tenant_id: &str) -> Result<Url, InfraError> {
        let mut url = Url::parse(&self.settings.authority_base_url)
            .map_err(|error| InfraError::Auth(format!("invalid authority url: {error}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| InfraError::Auth("authority URL cannot be a base".to_string()))?;
            segments.pop_if_empty();
            segments.push(tenant_id);
            segments.push("oauth2");
            segments.push("v2.0");
            segments.push("token");
        }
        Ok(url)
    }

    fn calendar_view_endpoint(
        &self,
        user_email: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Url, InfraError> {
        let mut url = Url::parse(&self.settings.graph_base_url)
            .map_err(|error| InfraError::Calendar(format!("invalid graph base url: {error}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| InfraError::Calendar("graph base URL cannot be a base".to_string()))?;
            segments.pop_if_empty();
            segments.push("users");
            segments.push(user_email);
            segments.push("calendarView");
        }
        url.query_pairs_mut()
            .append_pair(
                "startDateTime",
                &start.to_rfc3339_opts(SecondsFormat::Secs, true),
            )
            .append_pair("endDateTime", &end.to_rfc3339_opts(SecondsFormat::Secs, true))
            .append_pair("$select", "subject,start,end,isCancelled,isAllDay,showAs")
            .append_pair("$orderby", "start/dateTime")
            .append_pair("$top", PAGE_SIZE);
        Ok(url)
    }

    fn cached_token(&self, now: DateTime<Utc>) -> Result<Option<String>, InfraError> {
        let token = self
            .token
            .lock()
            .map_err(|error| InfraError::Auth(format!("token cache lock poisoned: {error}")))?;
        Ok(token
            .as_ref()
            .filter(|cached| cached.expires_at > now)
            .map(|cached| cached.access_token.clone()))
    }

    async fn access_token(&self) -> Result<String, InfraError> {
        let now = Utc::now();
        if let Some(token) = self.cached_token(now)? {
            return Ok(token);
        }

        let tenant_id = Self::required(&self.settings.tenant_id, "MICROSOFT_TENANT_ID")?;
        let client_id = Self::required(&self.settings.client_id, "MICROSOFT_CLIENT_ID")?;
        let client_secret =
            Self::required(&self.settings.client_secret, "MICROSOFT_CLIENT_SECRET")?;
        let endpoint = self.token_endpoint(tenant_id)?;

        let response = self
            .client
            .post(endpoint)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("scope", GRAPH_SCOPE),
            ])
            .send()
            .await
            .map_err(|error| InfraError::Auth(format!("token request failed: {error}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| InfraError::Auth(format!("failed reading token response: {error}")))?;
        let parsed = serde_json::from_str::<TokenResponsePayload>(&body).map_err(|error| {
            InfraError::Auth(format!("invalid token response payload: {error}; body={body}"))
        })?;

        if !status.is_success() || parsed.error.is_some() {
            let code = parsed
                .error
                .unwrap_or_else(|| format!("http_{}", status.as_u16()));
            let detail = parsed.error_description.unwrap_or(body);
            return Err(InfraError::Auth(format!("token endpoint error: {code}; {detail}")));
        }
        let access_token = parsed
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| InfraError::Auth("token response did not include access_token".to_string()))?;

        let lifetime = parsed.expires_in.unwrap_or(0).max(0) - TOKEN_EXPIRY_MARGIN_SECONDS;
        let mut cache = self
            .token
            .lock()
            .map_err(|error| InfraError::Auth(format!("token cache lock poisoned: {error}")))?;
        *cache = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at: now + Duration::seconds(lifetime.max(0)),
        });
        Ok(access_token)
    }
}

#[async_trait]
impl CalendarSource for GraphCalendarClient {
    async fn fetch_events(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, InfraError> {
        let user_email = Self::required(&self.settings.user_email, "MS_USER_EMAIL")?;
        let access_token = self.access_token().await?;

        let mut next_url = Some(self.calendar_view_endpoint(user_email, start, end)?);
        let mut events = Vec::new();
        while let Some(url) = next_url.take() {
            let response = self
                .client
                .get(url)
                .bearer_auth(&access_token)
                .header("Prefer", "outlook.timezone=\"UTC\"")
                .send()
                .await
                .map_err(|error| {
                    InfraError::Calendar(format!("network error while listing calendar events: {error}"))
                })?;

            let status = response.status();
            let body = response.text().await.map_err(|error| {
                InfraError::Calendar(format!("failed reading calendar view response: {error}"))
            })?;
            if !status.is_success() {
                return Err(Self::http_error(status, &body, user_email));
            }

            let page: CalendarViewPage = serde_json::from_str(&body).map_err(|error| {
                InfraError::Calendar(format!("invalid calendar view payload: {error}; body={body}"))
            })?;
            events.extend(map_page_events(page.value));

            if let Some(link) = page.next_link {
                next_url = Some(Url::parse(&link).map_err(|error| {
                    InfraError::Calendar(format!("invalid @odata.nextLink '{link}': {error}"))
                })?);
            }
        }

        tracing::debug!(count = events.len(), "loaded calendar events from graph");
        Ok(events)
    }
}

/// Maps one page; a malformed event is logged and dropped without failing the page.
fn map_page_events(events: Vec<GraphEvent>) -> Vec<CalendarEvent> {
    events
        .into_iter()
        .filter_map(|event| {
            let subject = event.subject.clone().unwrap_or_default();
            match map_graph_event(event) {
                Ok(mapped) => mapped,
                Err(error) => {
                    tracing::warn!(%subject, %error, "skipping malformed graph event");
                    None
                }
            }
        })
        .collect()
}

/// Cancelled, all-day and free events do not block time.
fn map_graph_event(event: GraphEvent) -> Result<Option<CalendarEvent>, InfraError> {
    if event.is_cancelled
        || event.is_all_day
        || event
            .show_as
            .as_deref()
            .is_some_and(|show_as| show_as.eq_ignore_ascii_case("free"))
    {
        return Ok(None);
    }
    let start = parse_graph_datetime(&event.start.date_time)?;
    let end = parse_graph_datetime(&event.end.date_time)?;
    let title = event.subject.unwrap_or_default();
    CalendarEvent::new(start, end, title)
        .map(Some)
        .map_err(InfraError::Calendar)
}

/// Graph returns wall-clock times without an offset in the zone requested via `Prefer`.
fn parse_graph_datetime(value: &str) -> Result<DateTime<Utc>, InfraError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|error| InfraError::Calendar(format!("invalid graph dateTime '{value}': {error}")))
}

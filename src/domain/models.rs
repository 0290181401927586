use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const SUGGESTIONS_PER_TASK: usize = 5;
pub const FREE_SLOT_LABEL: &str = "Free";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub label: String,
    pub duration_minutes: i64,
}

impl TimeSlot {
    pub fn validate(&self) -> Result<(), String> {
        if self.end < self.start {
            return Err("time_slot.end must not be before time_slot.start".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalendarEvent {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub title: String,
}

impl CalendarEvent {
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        title: impl Into<String>,
    ) -> Result<Self, String> {
        let event = Self {
            start,
            end,
            title: title.into(),
        };
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.end < self.start {
            return Err("calendar_event.end must not be before calendar_event.start".to_string());
        }
        Ok(())
    }

    pub fn overlaps(&self, window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> bool {
        self.start <= window_end && self.end >= window_start
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub content: String,
    pub due_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_datetime: Option<String>,
    pub priority: u8,
    pub project_id: String,
    #[serde(default)]
    pub optimized: bool,
}

impl Task {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "task.id")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub new_title: String,
    pub reason: String,
    pub estimated_duration_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionSet {
    pub task_id: String,
    pub suggestions: Vec<Suggestion>,
    pub created_at: DateTime<Utc>,
}

impl SuggestionSet {
    pub fn new(
        task_id: impl Into<String>,
        suggestions: Vec<Suggestion>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, String> {
        let set = Self {
            task_id: task_id.into(),
            suggestions,
            created_at,
        };
        set.validate()?;
        Ok(set)
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.task_id, "suggestion_set.task_id")?;
        if self.suggestions.len() != SUGGESTIONS_PER_TASK {
            return Err(format!(
                "suggestion_set.suggestions must contain exactly {SUGGESTIONS_PER_TASK} entries, got {}",
                self.suggestions.len()
            ));
        }
        for suggestion in &self.suggestions {
            validate_non_empty(&suggestion.new_title, "suggestion.new_title")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStage {
    Init,
    LoadingCalendar,
    LoadingTasks,
    ReconcilingSuggestions,
    Optimizing,
    Complete,
    Error,
}

impl AggregationStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::LoadingCalendar => "loading_calendar",
            Self::LoadingTasks => "loading_tasks",
            Self::ReconcilingSuggestions => "reconciling_suggestions",
            Self::Optimizing => "optimizing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub timestamp: DateTime<Utc>,
    pub date: NaiveDate,
    pub free_time_slots: Vec<TimeSlot>,
    pub total_free_hours: f64,
    pub overdue_tasks: Vec<Task>,
    pub due_today_tasks: Vec<Task>,
    pub events: Vec<TimeSlot>,
    pub task_suggestions: HashMap<String, SuggestionSet>,
    pub last_context_update: Option<DateTime<Utc>>,
    pub loaded_task_count: usize,
    pub stage: AggregationStage,
    pub error: Option<String>,
}

impl DashboardSnapshot {
    pub fn empty(date: NaiveDate, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            date,
            free_time_slots: Vec::new(),
            total_free_hours: 0.0,
            overdue_tasks: Vec::new(),
            due_today_tasks: Vec::new(),
            events: Vec::new(),
            task_suggestions: HashMap::new(),
            last_context_update: None,
            loaded_task_count: 0,
            stage: AggregationStage::Init,
            error: None,
        }
    }

    /// Error-shaped snapshot returned at the API boundary instead of a raw error.
    pub fn failed(date: NaiveDate, timestamp: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            stage: AggregationStage::Error,
            error: Some(message.into()),
            ..Self::empty(date, timestamp)
        }
    }
}

/// Daily working window, expressed in whole local hours of `timezone`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkSchedule {
    pub work_start_hour: u32,
    pub work_end_hour: u32,
    pub timezone: Tz,
}

impl Default for WorkSchedule {
    fn default() -> Self {
        Self {
            work_start_hour: 9,
            work_end_hour: 17,
            timezone: Tz::UTC,
        }
    }
}

impl WorkSchedule {
    pub fn validate(&self) -> Result<(), String> {
        if self.work_start_hour > 23 || self.work_end_hour > 23 {
            return Err(format!(
                "work hours must be within 0-23 (start={}, end={})",
                self.work_start_hour, self.work_end_hour
            ));
        }
        if self.work_start_hour >= self.work_end_hour {
            return Err(format!(
                "work start hour must be before work end hour (start={}, end={})",
                self.work_start_hour, self.work_end_hour
            ));
        }
        Ok(())
    }
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn sample_suggestion(title: &str) -> Suggestion {
        Suggestion {
            new_title: title.to_string(),
            reason: "clearer".to_string(),
            estimated_duration_minutes: 30,
        }
    }

    #[test]
    fn calendar_event_rejects_inverted_range() {
        let result = CalendarEvent::new(
            fixed_time("2026-02-16T10:00:00Z"),
            fixed_time("2026-02-16T09:00:00Z"),
            "standup",
        );
        assert!(result.is_err());
    }

    #[test]
    fn calendar_event_allows_zero_length() {
        let at = fixed_time("2026-02-16T10:00:00Z");
        assert!(CalendarEvent::new(at, at, "marker").is_ok());
    }

    #[test]
    fn suggestion_set_requires_fixed_arity() {
        let created = fixed_time("2026-02-16T08:00:00Z");
        let four = (0..4).map(|index| sample_suggestion(&format!("t{index}"))).collect();
        assert!(SuggestionSet::new("task-1", four, created).is_err());

        let five = (0..5).map(|index| sample_suggestion(&format!("t{index}"))).collect();
        assert!(SuggestionSet::new("task-1", five, created).is_ok());
    }

    #[test]
    fn suggestion_set_rejects_blank_title() {
        let created = fixed_time("2026-02-16T08:00:00Z");
        let mut suggestions: Vec<_> = (0..5).map(|index| sample_suggestion(&format!("t{index}"))).collect();
        suggestions[2].new_title = "  ".to_string();
        assert!(SuggestionSet::new("task-1", suggestions, created).is_err());
    }

    #[test]
    fn work_schedule_validation() {
        assert!(WorkSchedule::default().validate().is_ok());
        let inverted = WorkSchedule {
            work_start_hour: 17,
            work_end_hour: 9,
            ..WorkSchedule::default()
        };
        assert!(inverted.validate().is_err());
        let out_of_range = WorkSchedule {
            work_start_hour: 9,
            work_end_hour: 24,
            ..WorkSchedule::default()
        };
        assert!(out_of_range.validate().is_err());
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 16).expect("valid date");
        let snapshot = DashboardSnapshot::failed(date, fixed_time("2026-02-16T08:00:00Z"), "boom");
        let value = serde_json::to_value(&snapshot).expect("serialize snapshot");
        assert_eq!(value["error"], "boom");
        assert_eq!(value["stage"], "error");
        assert!(value.get("freeTimeSlots").is_some());
        assert!(value.get("totalFreeHours").is_some());
        assert!(value.get("lastContextUpdate").is_some());
    }
}

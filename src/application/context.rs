use crate::domain::models::{CalendarEvent, Task};
use chrono::{DateTime, Duration, Utc};

/// Background text handed to the suggestion generator: every known task and the day's events.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    text: String,
    last_update: Option<DateTime<Utc>>,
}

impl TaskContext {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    pub fn is_stale(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        match self.last_update {
            Some(last_update) if !self.text.is_empty() => now - last_update >= interval,
            _ => true,
        }
    }

    /// Rebuilds the text when stale. Returns whether a rebuild happened.
    pub fn refresh(
        &mut self,
        tasks: &[Task],
        events: &[CalendarEvent],
        now: DateTime<Utc>,
        interval: Duration,
    ) -> bool {
        if !self.is_stale(now, interval) {
            return false;
        }
        self.text = render_context(tasks, events);
        self.last_update = Some(now);
        true
    }
}

fn render_context(tasks: &[Task], events: &[CalendarEvent]) -> String {
    let mut lines = tasks
        .iter()
        .map(|task| format!("- {}", task.content))
        .collect::<Vec<_>>();
    if !events.is_empty() {
        lines.push("Appointments:".to_string());
        lines.extend(events.iter().map(|event| {
            format!(
                "- {} to {} UTC: {}",
                event.start.format("%Y-%m-%d %H:%M"),
                event.end.format("%H:%M"),
                event.title
            )
        }));
    }
    lines.join("\n")
}

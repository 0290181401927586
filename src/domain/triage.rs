use crate::domain::models::Task;
use chrono::NaiveDate;
use std::cmp::Ordering;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskTriage {
    pub overdue: Vec<Task>,
    pub due_today: Vec<Task>,
}

impl TaskTriage {
    /// Overdue tasks followed by tasks due today.
    pub fn relevant(&self) -> Vec<Task> {
        self.overdue
            .iter()
            .chain(self.due_today.iter())
            .cloned()
            .collect()
    }
}

/// Partitions tasks by due date against `reference_date`.
///
/// Tasks without a due date and tasks due after the reference date land in
/// neither bucket. Input order is kept inside each bucket.
pub fn classify(tasks: &[Task], reference_date: NaiveDate) -> TaskTriage {
    let mut triage = TaskTriage::default();
    for task in tasks {
        let Some(due_date) = task.due_date else {
            continue;
        };
        match due_date.cmp(&reference_date) {
            Ordering::Less => triage.overdue.push(task.clone()),
            Ordering::Equal => triage.due_today.push(task.clone()),
            Ordering::Greater => {}
        }
    }
    triage
}

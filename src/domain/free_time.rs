use crate::domain::models::{CalendarEvent, FREE_SLOT_LABEL, TimeSlot, WorkSchedule};
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Interval {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// Whole minutes between `start` and `end`, rounded half-up.
pub fn compute_duration(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let millis = (end - start).num_milliseconds();
    (millis + 30_000).div_euclid(60_000)
}

pub fn time_slot(start: DateTime<Utc>, end: DateTime<Utc>, label: impl Into<String>) -> TimeSlot {
    TimeSlot {
        start,
        end,
        label: label.into(),
        duration_minutes: compute_duration(start, end),
    }
}

pub fn event_slot(event: &CalendarEvent) -> TimeSlot {
    time_slot(event.start, event.end, event.title.clone())
}

/// Free windows inside `[work_start, work_end]` not covered by any busy event.
///
/// Events are clipped to the window and merged before the sweep, so overlapping,
/// nested and unsorted input all produce the same slots. Zero-length events are
/// not busy time.
pub fn compute_free_slots(
    busy_events: &[CalendarEvent],
    work_start: DateTime<Utc>,
    work_end: DateTime<Utc>,
) -> Result<Vec<TimeSlot>, InfraError> {
    if work_start >= work_end {
        return Err(InfraError::InvalidConfig(format!(
            "work window start {} must be before end {}",
            work_start.to_rfc3339(),
            work_end.to_rfc3339()
        )));
    }

    let busy_intervals = busy_events
        .iter()
        .filter(|event| event.end > event.start && event.overlaps(work_start, work_end))
        .filter_map(|event| {
            clip_interval(
                Interval {
                    start: event.start,
                    end: event.end,
                },
                work_start,
                work_end,
            )
        })
        .collect::<Vec<_>>();
    let busy_intervals = merge_intervals(busy_intervals);

    Ok(free_slots(work_start, work_end, &busy_intervals)
        .into_iter()
        .map(|interval| time_slot(interval.start, interval.end, FREE_SLOT_LABEL))
        .collect())
}

pub fn total_free_hours(slots: &[TimeSlot]) -> f64 {
    slots.iter().map(|slot| slot.duration_minutes).sum::<i64>() as f64 / 60.0
}

/// Resolves the configured work hours on `date` to UTC instants.
pub fn work_window(
    date: NaiveDate,
    schedule: &WorkSchedule,
) -> Result<(DateTime<Utc>, DateTime<Utc>), InfraError> {
    schedule.validate().map_err(InfraError::InvalidConfig)?;
    let start = local_hour(date, schedule.work_start_hour, schedule.timezone)?;
    let end = local_hour(date, schedule.work_end_hour, schedule.timezone)?;
    Ok((start, end))
}

/// Events overlapping the local day `date`, including ones that started the day before.
pub fn events_on(
    date: NaiveDate,
    events: &[CalendarEvent],
    timezone: Tz,
) -> Result<Vec<CalendarEvent>, InfraError> {
    let day_start = local_midnight(date, timezone)?;
    let next_day = date
        .succ_opt()
        .ok_or_else(|| InfraError::InvalidConfig(format!("date out of range: {date}")))?;
    let day_end = local_midnight(next_day, timezone)?;
    Ok(events
        .iter()
        .filter(|event| event.start < day_end && event.end > day_start)
        .cloned()
        .collect())
}

/// Midnight of `date` in `timezone`, as UTC.
pub fn local_midnight(date: NaiveDate, timezone: Tz) -> Result<DateTime<Utc>, InfraError> {
    local_hour(date, 0, timezone)
}

fn local_hour(date: NaiveDate, hour: u32, timezone: Tz) -> Result<DateTime<Utc>, InfraError> {
    let naive = date
        .and_hms_opt(hour, 0, 0)
        .ok_or_else(|| InfraError::InvalidConfig(format!("invalid hour {hour}")))?;
    // Inside a DST gap the wall-clock hour does not exist; the next hour does.
    let resolved = timezone
        .from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            timezone
                .from_local_datetime(&(naive + Duration::hours(1)))
                .earliest()
        })
        .ok_or_else(|| {
            InfraError::InvalidConfig(format!("{naive} does not exist in {}", timezone.name()))
        })?;
    Ok(resolved.with_timezone(&Utc))
}

fn clip_interval(
    interval: Interval,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Option<Interval> {
    if interval.end <= window_start || interval.start >= window_end {
        return None;
    }
    let start = interval.start.max(window_start);
    let end = interval.end.min(window_end);
    (end > start).then_some(Interval { start, end })
}

fn merge_intervals(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.sort_unstable_by(|left, right| left.start.cmp(&right.start));
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            Some(last) if interval.start <= last.end => {
                if interval.end > last.end {
                    last.end = interval.end;
                }
            }
            _ => merged.push(interval),
        }
    }
    merged
}

fn free_slots(
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    busy_intervals: &[Interval],
) -> Vec<Interval> {
    let mut slots = Vec::new();
    let mut cursor = window_start;
    for interval in busy_intervals {
        if cursor < interval.start {
            slots.push(Interval {
                start: cursor,
                end: interval.start,
            });
        }
        if interval.end > cursor {
            cursor = interval.end;
        }
    }
    if cursor < window_end {
        slots.push(Interval {
            start: cursor,
            end: window_end,
        });
    }
    slots
}

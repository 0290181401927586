use crate::application::context::TaskContext;
use crate::application::progress::{DashboardEvent, ProgressSink};
use crate::application::suggestion_cache::SuggestionCache;
use crate::domain::free_time::{
    compute_free_slots, event_slot, events_on, local_midnight, total_free_hours, work_window,
};
use crate::domain::models::{
    AggregationStage, CalendarEvent, DashboardSnapshot, SuggestionSet, Task,
};
use crate::domain::triage::classify;
use crate::infrastructure::config::DashboardConfig;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::graph_calendar_client::CalendarSource;
use crate::infrastructure::openai_client::SuggestionGenerator;
use crate::infrastructure::suggestion_store::SuggestionStore;
use crate::infrastructure::todoist_client::TaskSource;
use chrono::{DateTime, Days, Duration, NaiveDate, Utc};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration as TokioDuration, sleep};

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationRequest {
    /// Target day; today in the configured time zone when absent.
    pub date: Option<NaiveDate>,
    /// Drops every cached suggestion set before reconciling.
    pub force_update: bool,
}

/// Builds a dashboard snapshot from the calendar, the task list and the suggestion cache.
pub struct DashboardAggregator<C, T, G, S>
where
    C: CalendarSource,
    T: TaskSource,
    G: SuggestionGenerator,
    S: SuggestionStore,
{
    calendar: Arc<C>,
    tasks: Arc<T>,
    generator: Arc<G>,
    cache: SuggestionCache<S>,
    config: DashboardConfig,
    context: Mutex<TaskContext>,
    now_provider: NowProvider,
}

impl<C, T, G, S> DashboardAggregator<C, T, G, S>
where
    C: CalendarSource,
    T: TaskSource,
    G: SuggestionGenerator,
    S: SuggestionStore,
{
    pub fn new(
        calendar: Arc<C>,
        tasks: Arc<T>,
        generator: Arc<G>,
        store: Arc<S>,
        config: DashboardConfig,
    ) -> Self {
        Self {
            calendar,
            tasks,
            generator,
            cache: SuggestionCache::new(store),
            config,
            context: Mutex::new(TaskContext::default()),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.cache = self.cache.with_now_provider(now_provider.clone());
        self.now_provider = now_provider;
        self
    }

    pub fn cache(&self) -> &SuggestionCache<S> {
        &self.cache
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.now_provider)()
    }

    pub fn today(&self) -> NaiveDate {
        self.now()
            .with_timezone(&self.config.schedule.timezone)
            .date_naive()
    }

    /// Current context text and the time it was built.
    pub fn context(&self) -> Result<(String, Option<DateTime<Utc>>), InfraError> {
        let context = self.lock_context()?;
        Ok((context.text().to_string(), context.last_update()))
    }

    fn lock_context(&self) -> Result<std::sync::MutexGuard<'_, TaskContext>, InfraError> {
        self.context
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("task context lock poisoned: {error}")))
    }

    fn enter(&self, sink: &dyn ProgressSink, snapshot: &mut DashboardSnapshot, stage: AggregationStage) {
        snapshot.stage = stage;
        tracing::debug!(stage = stage.as_str(), date = %snapshot.date, "dashboard aggregation stage");
        sink.emit(DashboardEvent::Stage {
            stage,
            message: stage_message(stage).to_string(),
        });
    }

    fn record_failure(
        sink: &dyn ProgressSink,
        errors: &mut Vec<String>,
        stage: AggregationStage,
        error: &InfraError,
    ) {
        tracing::warn!(stage = stage.as_str(), %error, "collaborator failed; continuing with empty data");
        errors.push(error.to_string());
        sink.emit(DashboardEvent::Failed {
            stage,
            reason: error.to_string(),
        });
    }

    /// Runs one aggregation pass.
    ///
    /// Calendar and task failures are recorded in the snapshot and a failed suggestion
    /// only skips its task. An unusable work window is returned as an error.
    pub async fn aggregate(
        &self,
        request: AggregationRequest,
        sink: &dyn ProgressSink,
    ) -> Result<DashboardSnapshot, InfraError> {
        match self.run(request, sink).await {
            Ok(snapshot) => Ok(snapshot),
            Err(error) => {
                tracing::error!(%error, "dashboard aggregation failed");
                sink.emit(DashboardEvent::Failed {
                    stage: AggregationStage::Error,
                    reason: error.to_string(),
                });
                Err(error)
            }
        }
    }

    async fn run(
        &self,
        request: AggregationRequest,
        sink: &dyn ProgressSink,
    ) -> Result<DashboardSnapshot, InfraError> {
        let now = self.now();
        let timezone = self.config.schedule.timezone;
        let date = request.date.unwrap_or_else(|| self.today());
        let mut snapshot = DashboardSnapshot::empty(date, now);
        let mut errors = Vec::new();
        self.enter(sink, &mut snapshot, AggregationStage::Init);

        self.enter(sink, &mut snapshot, AggregationStage::LoadingCalendar);
        let (work_start, work_end) = work_window(date, &self.config.schedule)?;
        let range_start = local_midnight(date, timezone)?;
        let range_end_date = date
            .checked_add_days(Days::new(u64::from(self.config.days_to_include)))
            .ok_or_else(|| InfraError::InvalidConfig(format!("date out of range: {date}")))?;
        let range_end = local_midnight(range_end_date, timezone)?;
        let mut events = match self.calendar.fetch_events(range_start, range_end).await {
            Ok(events) => events,
            Err(error) => {
                Self::record_failure(sink, &mut errors, AggregationStage::LoadingCalendar, &error);
                Vec::new()
            }
        };
        events.sort_by(|left, right| left.start.cmp(&right.start));
        let day_events = events_on(date, &events, timezone)?;
        snapshot.free_time_slots = compute_free_slots(&events, work_start, work_end)?;
        snapshot.total_free_hours = total_free_hours(&snapshot.free_time_slots);
        snapshot.events = events.iter().map(event_slot).collect();

        self.enter(sink, &mut snapshot, AggregationStage::LoadingTasks);
        let mut tasks = match self.tasks.fetch_tasks().await {
            Ok(tasks) => tasks,
            Err(error) => {
                Self::record_failure(sink, &mut errors, AggregationStage::LoadingTasks, &error);
                Vec::new()
            }
        };
        self.cache.apply_optimized_flags(&mut tasks);
        let triage = classify(&tasks, date);
        snapshot.loaded_task_count = tasks.len();
        snapshot.overdue_tasks = triage.overdue.clone();
        snapshot.due_today_tasks = triage.due_today.clone();
        let context_text = self.refresh_context(&tasks, &day_events, now, &mut snapshot)?;
        sink.emit(DashboardEvent::Snapshot {
            snapshot: Box::new(snapshot.clone()),
        });

        self.enter(sink, &mut snapshot, AggregationStage::ReconcilingSuggestions);
        if request.force_update {
            tracing::info!(date = %date, "force update requested; clearing suggestion cache");
            self.cache.force_clear();
        }
        // Only today's refresh may prune; a look at another day must not discard today's sets.
        let reconciliation = if date == now.with_timezone(&timezone).date_naive() {
            self.cache.reconcile(&triage.relevant())
        } else {
            self.cache.pending(&triage.relevant())
        };
        snapshot.task_suggestions = reconciliation.retained;

        self.enter(sink, &mut snapshot, AggregationStage::Optimizing);
        self.optimize(&reconciliation.missing, &context_text, sink, &mut snapshot)
            .await;

        self.enter(sink, &mut snapshot, AggregationStage::Complete);
        if !errors.is_empty() {
            snapshot.error = Some(errors.join("; "));
        }
        sink.emit(DashboardEvent::Snapshot {
            snapshot: Box::new(snapshot.clone()),
        });
        tracing::info!(
            date = %date,
            free_hours = snapshot.total_free_hours,
            overdue = snapshot.overdue_tasks.len(),
            due_today = snapshot.due_today_tasks.len(),
            suggestions = snapshot.task_suggestions.len(),
            "dashboard aggregation complete"
        );
        Ok(snapshot)
    }

    fn refresh_context(
        &self,
        tasks: &[Task],
        events: &[CalendarEvent],
        now: DateTime<Utc>,
        snapshot: &mut DashboardSnapshot,
    ) -> Result<String, InfraError> {
        let interval = Duration::milliseconds(
            i64::try_from(self.config.context_refresh_interval_ms).unwrap_or(i64::MAX),
        );
        let mut context = self.lock_context()?;
        if context.refresh(tasks, events, now, interval) {
            tracing::debug!(tasks = tasks.len(), "task context refreshed");
        }
        snapshot.last_context_update = context.last_update();
        Ok(context.text().to_string())
    }

    async fn optimize(
        &self,
        missing: &[Task],
        context_text: &str,
        sink: &dyn ProgressSink,
        snapshot: &mut DashboardSnapshot,
    ) {
        let total = missing.len();
        for (index, task) in missing.iter().enumerate() {
            if sink.is_cancelled() {
                tracing::info!(processed = index, total, "progress consumer disconnected; stopping suggestions");
                break;
            }
            if index > 0 && self.config.suggestion_delay_ms > 0 {
                sleep(TokioDuration::from_millis(self.config.suggestion_delay_ms)).await;
            }

            let suggestions = match self.generator.generate(task, context_text).await {
                Ok(suggestions) => suggestions,
                Err(error) => {
                    tracing::warn!(task_id = %task.id, %error, "suggestion generation failed; skipping task");
                    continue;
                }
            };
            let set = match SuggestionSet::new(task.id.clone(), suggestions, self.now()) {
                Ok(set) => set,
                Err(message) => {
                    tracing::warn!(task_id = %task.id, %message, "generator returned an unusable suggestion set");
                    continue;
                }
            };

            self.cache.upsert(set.clone());
            snapshot.task_suggestions.insert(task.id.clone(), set.clone());
            sink.emit(DashboardEvent::TaskOptimized {
                task_id: task.id.clone(),
                suggestions: set,
                processed: index + 1,
                total,
            });
        }
    }
}

fn stage_message(stage: AggregationStage) -> &'static str {
    match stage {
        AggregationStage::Init => "starting dashboard refresh",
        AggregationStage::LoadingCalendar => "loading calendar events",
        AggregationStage::LoadingTasks => "loading tasks",
        AggregationStage::ReconcilingSuggestions => "checking cached suggestions",
        AggregationStage::Optimizing => "generating title suggestions",
        AggregationStage::Complete => "dashboard ready",
        AggregationStage::Error => "dashboard refresh failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::progress::NoopSink;
    use crate::domain::models::{FREE_SLOT_LABEL, Suggestion};
    use crate::infrastructure::suggestion_store::InMemorySuggestionStore;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 16).expect("valid date")
    }

    fn fixed_now() -> NowProvider {
        Arc::new(|| at("2026-02-16T07:30:00Z"))
    }

    fn task(id: &str, due_date: Option<NaiveDate>) -> Task {
        Task {
            id: id.to_string(),
            content: format!("task {id}"),
            due_date,
            due_datetime: None,
            priority: 1,
            project_id: "inbox".to_string(),
            optimized: false,
        }
    }

    fn config() -> DashboardConfig {
        DashboardConfig {
            suggestion_delay_ms: 0,
            ..DashboardConfig::default()
        }
    }

    #[derive(Default)]
    struct FakeCalendar {
        events: Vec<CalendarEvent>,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CalendarSource for FakeCalendar {
        async fn fetch_events(
            &self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<CalendarEvent>, InfraError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                return Err(InfraError::NotFound("calendar not found for user me@example.com".to_string()));
            }
            Ok(self
                .events
                .iter()
                .filter(|event| event.start < end && event.end > start)
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct FakeTasks {
        tasks: Vec<Task>,
        fail: bool,
    }

    #[async_trait]
    impl TaskSource for FakeTasks {
        async fn fetch_tasks(&self) -> Result<Vec<Task>, InfraError> {
            if self.fail {
                return Err(InfraError::TaskSource("todoist unavailable".to_string()));
            }
            Ok(self.tasks.clone())
        }

        async fn update_task_title(&self, _task_id: &str, _new_title: &str) -> Result<(), InfraError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeGenerator {
        calls: AtomicUsize,
        failing_ids: HashSet<String>,
        contexts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SuggestionGenerator for FakeGenerator {
        async fn generate(&self, task: &Task, context: &str) -> Result<Vec<Suggestion>, InfraError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if let Ok(mut contexts) = self.contexts.lock() {
                contexts.push(context.to_string());
            }
            if self.failing_ids.contains(&task.id) {
                return Err(InfraError::Suggestion("model refused".to_string()));
            }
            Ok((0..5)
                .map(|index| Suggestion {
                    new_title: format!("{} v{index}", task.content),
                    reason: "more concrete".to_string(),
                    estimated_duration_minutes: 30,
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<DashboardEvent>>,
        cancel_after_optimized: Option<usize>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<DashboardEvent> {
            self.events.lock().expect("sink lock").clone()
        }

        fn stages(&self) -> Vec<AggregationStage> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    DashboardEvent::Stage { stage, .. } => Some(stage),
                    _ => None,
                })
                .collect()
        }
    }

    impl ProgressSink for RecordingSink {
        fn emit(&self, event: DashboardEvent) {
            self.events.lock().expect("sink lock").push(event);
        }

        fn is_cancelled(&self) -> bool {
            let Some(limit) = self.cancel_after_optimized else {
                return false;
            };
            let optimized = self
                .events
                .lock()
                .expect("sink lock")
                .iter()
                .filter(|event| matches!(event, DashboardEvent::TaskOptimized { .. }))
                .count();
            optimized >= limit
        }
    }

    type TestAggregator =
        DashboardAggregator<FakeCalendar, FakeTasks, FakeGenerator, InMemorySuggestionStore>;

    struct Harness {
        aggregator: TestAggregator,
        calendar: Arc<FakeCalendar>,
        generator: Arc<FakeGenerator>,
    }

    fn harness(calendar: FakeCalendar, tasks: FakeTasks, generator: FakeGenerator) -> Harness {
        let calendar = Arc::new(calendar);
        let generator = Arc::new(generator);
        let aggregator = DashboardAggregator::new(
            calendar.clone(),
            Arc::new(tasks),
            generator.clone(),
            Arc::new(InMemorySuggestionStore::default()),
            config(),
        )
        .with_now_provider(fixed_now());
        Harness {
            aggregator,
            calendar,
            generator,
        }
    }

    fn standard_tasks() -> FakeTasks {
        FakeTasks {
            tasks: vec![
                task("overdue", Some(today() - Days::new(1))),
                task("today", Some(today())),
                task("later", Some(today() + Days::new(1))),
                task("undated", None),
            ],
            fail: false,
        }
    }

    fn meeting() -> CalendarEvent {
        CalendarEvent::new(at("2026-02-16T10:00:00Z"), at("2026-02-16T11:00:00Z"), "Planning")
            .expect("valid event")
    }

    #[tokio::test]
    async fn full_pass_builds_snapshot() {
        let harness = harness(
            FakeCalendar {
                events: vec![meeting()],
                ..FakeCalendar::default()
            },
            standard_tasks(),
            FakeGenerator::default(),
        );
        let sink = RecordingSink::default();

        let snapshot = harness
            .aggregator
            .aggregate(AggregationRequest::default(), &sink)
            .await
            .expect("aggregate");

        assert_eq!(snapshot.date, today());
        assert_eq!(snapshot.stage, AggregationStage::Complete);
        assert!(snapshot.error.is_none());
        assert_eq!(snapshot.free_time_slots.len(), 2);
        assert!(snapshot.free_time_slots.iter().all(|slot| slot.label == FREE_SLOT_LABEL));
        assert_eq!(snapshot.total_free_hours, 7.0);
        assert_eq!(snapshot.events.len(), 1);
        assert_eq!(snapshot.events[0].label, "Planning");
        assert_eq!(snapshot.events[0].duration_minutes, 60);
        assert_eq!(snapshot.loaded_task_count, 4);
        assert_eq!(snapshot.overdue_tasks[0].id, "overdue");
        assert_eq!(snapshot.due_today_tasks[0].id, "today");
        assert_eq!(snapshot.task_suggestions.len(), 2);
        assert_eq!(snapshot.last_context_update, Some(at("2026-02-16T07:30:00Z")));
        assert_eq!(harness.generator.calls.load(Ordering::Relaxed), 2);

        let contexts = harness.generator.contexts.lock().expect("contexts").clone();
        assert!(contexts[0].contains("- task later"));
        assert!(contexts[0].contains("Planning"));
    }

    #[tokio::test]
    async fn stages_are_emitted_in_order() {
        let harness = harness(FakeCalendar::default(), standard_tasks(), FakeGenerator::default());
        let sink = RecordingSink::default();

        harness
            .aggregator
            .aggregate(AggregationRequest::default(), &sink)
            .await
            .expect("aggregate");

        assert_eq!(
            sink.stages(),
            vec![
                AggregationStage::Init,
                AggregationStage::LoadingCalendar,
                AggregationStage::LoadingTasks,
                AggregationStage::ReconcilingSuggestions,
                AggregationStage::Optimizing,
                AggregationStage::Complete,
            ]
        );
        let events = sink.events();
        let intermediate = events
            .iter()
            .position(|event| matches!(event, DashboardEvent::Snapshot { snapshot } if snapshot.stage == AggregationStage::LoadingTasks))
            .expect("intermediate snapshot");
        let first_optimized = events
            .iter()
            .position(|event| matches!(event, DashboardEvent::TaskOptimized { .. }))
            .expect("optimized event");
        assert!(intermediate < first_optimized);
        match events.last() {
            Some(DashboardEvent::Snapshot { snapshot }) => {
                assert_eq!(snapshot.stage, AggregationStage::Complete)
            }
            other => panic!("expected final snapshot, got {other:?}"),
        }
        let progress = events
            .iter()
            .filter_map(|event| match event {
                DashboardEvent::TaskOptimized { processed, total, .. } => Some((*processed, *total)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(progress, vec![(1, 2), (2, 2)]);
    }

    #[tokio::test]
    async fn second_pass_makes_no_generator_calls() {
        let harness = harness(FakeCalendar::default(), standard_tasks(), FakeGenerator::default());

        let first = harness
            .aggregator
            .aggregate(AggregationRequest::default(), &RecordingSink::default())
            .await
            .expect("first pass");
        let second = harness
            .aggregator
            .aggregate(AggregationRequest::default(), &RecordingSink::default())
            .await
            .expect("second pass");

        assert_eq!(harness.generator.calls.load(Ordering::Relaxed), 2);
        assert_eq!(first.task_suggestions, second.task_suggestions);
    }

    #[tokio::test]
    async fn force_update_regenerates_everything() {
        let harness = harness(FakeCalendar::default(), standard_tasks(), FakeGenerator::default());
        harness
            .aggregator
            .aggregate(AggregationRequest::default(), &RecordingSink::default())
            .await
            .expect("first pass");

        harness
            .aggregator
            .aggregate(
                AggregationRequest {
                    date: None,
                    force_update: true,
                },
                &RecordingSink::default(),
            )
            .await
            .expect("forced pass");

        assert_eq!(harness.generator.calls.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn calendar_failure_yields_partial_snapshot() {
        let harness = harness(
            FakeCalendar {
                fail: true,
                ..FakeCalendar::default()
            },
            standard_tasks(),
            FakeGenerator::default(),
        );
        let sink = RecordingSink::default();

        let snapshot = harness
            .aggregator
            .aggregate(AggregationRequest::default(), &sink)
            .await
            .expect("partial snapshot");

        assert_eq!(snapshot.stage, AggregationStage::Complete);
        assert_eq!(snapshot.free_time_slots.len(), 1);
        assert_eq!(snapshot.total_free_hours, 8.0);
        assert!(snapshot.events.is_empty());
        assert_eq!(snapshot.due_today_tasks.len(), 1);
        assert!(snapshot.error.as_deref().is_some_and(|error| error.contains("calendar not found")));
        assert!(sink.events().iter().any(|event| matches!(
            event,
            DashboardEvent::Failed { stage: AggregationStage::LoadingCalendar, .. }
        )));
    }

    #[tokio::test]
    async fn overnight_event_counts_as_busy() {
        let overnight =
            CalendarEvent::new(at("2026-02-15T20:00:00Z"), at("2026-02-16T12:00:00Z"), "Night shift")
                .expect("valid event");
        let harness = harness(
            FakeCalendar {
                events: vec![overnight],
                ..FakeCalendar::default()
            },
            standard_tasks(),
            FakeGenerator::default(),
        );

        let snapshot = harness
            .aggregator
            .aggregate(AggregationRequest::default(), &RecordingSink::default())
            .await
            .expect("aggregate");

        assert_eq!(snapshot.events.len(), 1);
        assert_eq!(snapshot.free_time_slots.len(), 1);
        assert_eq!(snapshot.free_time_slots[0].start, at("2026-02-16T12:00:00Z"));
        assert_eq!(snapshot.total_free_hours, 5.0);
        let contexts = harness.generator.contexts.lock().expect("contexts").clone();
        assert!(contexts[0].contains("Night shift"));
    }

    #[tokio::test]
    async fn other_day_view_keeps_todays_suggestions() {
        let harness = harness(FakeCalendar::default(), standard_tasks(), FakeGenerator::default());
        harness
            .aggregator
            .aggregate(AggregationRequest::default(), &RecordingSink::default())
            .await
            .expect("today");
        assert_eq!(harness.aggregator.cache().entries().len(), 2);

        let past = harness
            .aggregator
            .aggregate(
                AggregationRequest {
                    date: Some(today() - Days::new(3)),
                    force_update: false,
                },
                &RecordingSink::default(),
            )
            .await
            .expect("past day");
        assert!(past.task_suggestions.is_empty());
        assert_eq!(harness.aggregator.cache().entries().len(), 2);

        harness
            .aggregator
            .aggregate(AggregationRequest::default(), &RecordingSink::default())
            .await
            .expect("today again");
        assert_eq!(harness.generator.calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn task_failure_yields_empty_task_lists() {
        let harness = harness(
            FakeCalendar::default(),
            FakeTasks {
                tasks: Vec::new(),
                fail: true,
            },
            FakeGenerator::default(),
        );

        let snapshot = harness
            .aggregator
            .aggregate(AggregationRequest::default(), &RecordingSink::default())
            .await
            .expect("partial snapshot");

        assert!(snapshot.overdue_tasks.is_empty());
        assert!(snapshot.due_today_tasks.is_empty());
        assert!(snapshot.error.as_deref().is_some_and(|error| error.contains("todoist unavailable")));
        assert_eq!(harness.generator.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn generator_failure_skips_only_that_task() {
        let harness = harness(
            FakeCalendar::default(),
            standard_tasks(),
            FakeGenerator {
                failing_ids: HashSet::from(["overdue".to_string()]),
                ..FakeGenerator::default()
            },
        );

        let snapshot = harness
            .aggregator
            .aggregate(AggregationRequest::default(), &RecordingSink::default())
            .await
            .expect("aggregate");

        assert!(snapshot.error.is_none());
        assert!(!snapshot.task_suggestions.contains_key("overdue"));
        assert!(snapshot.task_suggestions.contains_key("today"));
        assert_eq!(harness.aggregator.cache().entries().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_task() {
        let tasks = FakeTasks {
            tasks: (0..4).map(|index| task(&format!("t{index}"), Some(today()))).collect(),
            fail: false,
        };
        let harness = harness(FakeCalendar::default(), tasks, FakeGenerator::default());
        let sink = RecordingSink {
            cancel_after_optimized: Some(1),
            ..RecordingSink::default()
        };

        harness
            .aggregator
            .aggregate(AggregationRequest::default(), &sink)
            .await
            .expect("aggregate");

        assert_eq!(harness.generator.calls.load(Ordering::Relaxed), 1);
        assert_eq!(harness.aggregator.cache().entries().len(), 1);
    }

    #[tokio::test]
    async fn optimized_tasks_are_not_resuggested() {
        let harness = harness(FakeCalendar::default(), standard_tasks(), FakeGenerator::default());
        harness.aggregator.cache().mark_optimized("today");

        let snapshot = harness
            .aggregator
            .aggregate(AggregationRequest::default(), &RecordingSink::default())
            .await
            .expect("aggregate");

        assert_eq!(harness.generator.calls.load(Ordering::Relaxed), 1);
        assert!(snapshot.due_today_tasks[0].optimized);
        assert!(!snapshot.task_suggestions.contains_key("today"));
    }

    #[tokio::test]
    async fn explicit_date_and_multi_day_range() {
        let tomorrow = today() + Days::new(1);
        let calendar = FakeCalendar {
            events: vec![
                meeting(),
                CalendarEvent::new(at("2026-02-17T09:00:00Z"), at("2026-02-17T12:00:00Z"), "Workshop")
                    .expect("valid event"),
            ],
            ..FakeCalendar::default()
        };
        let calendar = Arc::new(calendar);
        let aggregator = DashboardAggregator::new(
            calendar.clone(),
            Arc::new(standard_tasks()),
            Arc::new(FakeGenerator::default()),
            Arc::new(InMemorySuggestionStore::default()),
            DashboardConfig {
                days_to_include: 2,
                ..config()
            },
        )
        .with_now_provider(fixed_now());

        let snapshot = aggregator
            .aggregate(
                AggregationRequest {
                    date: Some(tomorrow),
                    force_update: false,
                },
                &RecordingSink::default(),
            )
            .await
            .expect("aggregate");

        assert_eq!(snapshot.date, tomorrow);
        assert_eq!(snapshot.events.len(), 1);
        assert_eq!(snapshot.total_free_hours, 5.0);
        assert_eq!(snapshot.overdue_tasks.len(), 2);
        assert_eq!(snapshot.due_today_tasks[0].id, "later");
        assert_eq!(calendar.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn invalid_schedule_is_an_error() {
        let aggregator = DashboardAggregator::new(
            Arc::new(FakeCalendar::default()),
            Arc::new(FakeTasks::default()),
            Arc::new(FakeGenerator::default()),
            Arc::new(InMemorySuggestionStore::default()),
            DashboardConfig {
                schedule: crate::domain::models::WorkSchedule {
                    work_start_hour: 17,
                    work_end_hour: 9,
                    timezone: chrono_tz::Tz::UTC,
                },
                ..config()
            },
        );
        let sink = RecordingSink::default();

        let result = aggregator.aggregate(AggregationRequest::default(), &sink).await;

        assert!(matches!(result, Err(InfraError::InvalidConfig(_))));
        assert!(sink.events().iter().any(|event| matches!(
            event,
            DashboardEvent::Failed { stage: AggregationStage::Error, .. }
        )));
    }

    proptest! {
        #[test]
        fn repeated_aggregation_is_idempotent(offsets in prop::collection::vec(-3i64..3, 0..8)) {
            let runtime = tokio::runtime::Runtime::new().expect("create tokio runtime");
            let tasks = offsets
                .iter()
                .enumerate()
                .map(|(index, offset)| task(&format!("t{index}"), Some(today() + Duration::days(*offset))))
                .collect::<Vec<_>>();
            let relevant = offsets.iter().filter(|offset| **offset <= 0).count();
            let harness = harness(
                FakeCalendar::default(),
                FakeTasks { tasks, fail: false },
                FakeGenerator::default(),
            );

            let (first, second) = runtime.block_on(async {
                let first = harness
                    .aggregator
                    .aggregate(AggregationRequest::default(), &NoopSink)
                    .await
                    .expect("first pass");
                let second = harness
                    .aggregator
                    .aggregate(AggregationRequest::default(), &NoopSink)
                    .await
                    .expect("second pass");
                (first, second)
            });

            prop_assert_eq!(harness.generator.calls.load(Ordering::Relaxed), relevant);
            prop_assert_eq!(first.task_suggestions.len(), relevant);
            prop_assert_eq!(first.task_suggestions, second.task_suggestions);
            prop_assert_eq!(harness.calendar.calls.load(Ordering::Relaxed), 2);
        }
    }
}

use crate::domain::models::{SuggestionSet, Task};
use crate::infrastructure::suggestion_store::{SuggestionMap, SuggestionStore};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// Relevant tasks that still need suggestions, in input order.
    pub missing: Vec<Task>,
    /// Cached task ids that were dropped because the task is no longer relevant.
    pub orphaned: Vec<String>,
    pub retained: SuggestionMap,
}

/// Persistent task id → suggestion set cache in front of the suggestion generator.
///
/// Every mutation is load → modify → save under one in-process lock. Store
/// failures are logged and never surface to callers: reads fall back to an
/// empty cache and writes are skipped.
pub struct SuggestionCache<S>
where
    S: SuggestionStore,
{
    store: Arc<S>,
    write_lock: Mutex<()>,
    now_provider: NowProvider,
}

impl<S> SuggestionCache<S>
where
    S: SuggestionStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded value is `()`, so a poisoned lock carries no broken state.
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_or_empty(&self) -> SuggestionMap {
        self.store.load().unwrap_or_else(|error| {
            tracing::warn!(%error, "suggestion cache unreadable; treating as empty");
            SuggestionMap::new()
        })
    }

    fn optimized_or_empty(&self) -> HashSet<String> {
        self.store.load_optimized().unwrap_or_else(|error| {
            tracing::warn!(%error, "optimized task ids unreadable; treating as empty");
            HashSet::new()
        })
    }

    fn persist(&self, sets: &SuggestionMap) {
        if let Err(error) = self.store.save(sets) {
            tracing::warn!(%error, "failed to persist suggestion cache");
        }
    }

    pub fn entries(&self) -> SuggestionMap {
        let _guard = self.lock();
        self.load_or_empty()
    }

    /// Sets `optimized` on every task whose id was marked optimized earlier.
    pub fn apply_optimized_flags(&self, tasks: &mut [Task]) {
        let optimized = self.optimized_or_empty();
        for task in tasks.iter_mut() {
            if optimized.contains(&task.id) {
                task.optimized = true;
            }
        }
    }

    /// Prunes entries for tasks outside `relevant` and reports which relevant tasks still lack suggestions.
    pub fn reconcile(&self, relevant: &[Task]) -> Reconciliation {
        let _guard = self.lock();
        let mut sets = self.load_or_empty();
        let optimized = self.optimized_or_empty();
        let relevant_ids = relevant
            .iter()
            .map(|task| task.id.as_str())
            .collect::<HashSet<_>>();

        let mut orphaned = sets
            .keys()
            .filter(|task_id| !relevant_ids.contains(task_id.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        orphaned.sort();
        if !orphaned.is_empty() {
            for task_id in &orphaned {
                sets.remove(task_id);
            }
            tracing::info!(count = orphaned.len(), "pruned suggestion sets for tasks no longer due");
            self.persist(&sets);
        }

        Reconciliation {
            missing: missing_sets(relevant, &sets, &optimized),
            orphaned,
            retained: sets,
        }
    }

    /// Same report as [`Self::reconcile`] for a day other than today: nothing is pruned,
    /// and only sets belonging to `relevant` are returned.
    pub fn pending(&self, relevant: &[Task]) -> Reconciliation {
        let _guard = self.lock();
        let mut sets = self.load_or_empty();
        let optimized = self.optimized_or_empty();
        let relevant_ids = relevant
            .iter()
            .map(|task| task.id.as_str())
            .collect::<HashSet<_>>();
        sets.retain(|task_id, _| relevant_ids.contains(task_id.as_str()));

        Reconciliation {
            missing: missing_sets(relevant, &sets, &optimized),
            orphaned: Vec::new(),
            retained: sets,
        }
    }

    /// Stores one set and persists right away.
    pub fn upsert(&self, set: SuggestionSet) {
        let _guard = self.lock();
        let mut sets = match self.store.load() {
            Ok(sets) => sets,
            Err(error) => {
                tracing::warn!(%error, task_id = %set.task_id, "suggestion cache unreadable; skipping write");
                return;
            }
        };
        sets.insert(set.task_id.clone(), set);
        self.persist(&sets);
    }

    pub fn remove(&self, task_id: &str) {
        let _guard = self.lock();
        if let Err(error) = self.store.delete(task_id) {
            tracing::warn!(%error, task_id, "failed to remove suggestion set");
        }
    }

    /// Records that the user accepted a suggestion: the task is never re-suggested and its set is dropped.
    pub fn mark_optimized(&self, task_id: &str) {
        let _guard = self.lock();
        if let Err(error) = self.store.mark_optimized(task_id, (self.now_provider)()) {
            tracing::warn!(%error, task_id, "failed to persist optimized flag");
        }
        if let Err(error) = self.store.delete(task_id) {
            tracing::warn!(%error, task_id, "failed to remove suggestion set");
        }
    }

    pub fn force_clear(&self) {
        let _guard = self.lock();
        self.persist(&SuggestionMap::new());
    }
}

fn missing_sets(relevant: &[Task], sets: &SuggestionMap, optimized: &HashSet<String>) -> Vec<Task> {
    relevant
        .iter()
        .filter(|task| {
            !sets.contains_key(&task.id) && !task.optimized && !optimized.contains(&task.id)
        })
        .cloned()
        .collect()
}

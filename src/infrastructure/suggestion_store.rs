use crate::domain::models::SuggestionSet;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub type SuggestionMap = HashMap<String, SuggestionSet>;

/// Durable task id → suggestion set mapping plus the set of optimized task ids.
pub trait SuggestionStore: Send + Sync {
    fn load(&self) -> Result<SuggestionMap, InfraError>;
    /// Replaces every stored set with `sets`.
    fn save(&self, sets: &SuggestionMap) -> Result<(), InfraError>;
    fn delete(&self, task_id: &str) -> Result<(), InfraError>;
    fn load_optimized(&self) -> Result<HashSet<String>, InfraError>;
    fn mark_optimized(&self, task_id: &str, at: DateTime<Utc>) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteSuggestionStore {
    db_path: PathBuf,
}

impl SqliteSuggestionStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }
}

impl SuggestionStore for SqliteSuggestionStore {
    fn load(&self) -> Result<SuggestionMap, InfraError> {
        let connection = self.connect()?;
        let mut statement =
            connection.prepare("SELECT task_id, payload FROM suggestion_sets ORDER BY task_id")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut sets = SuggestionMap::new();
        for row in rows {
            let (task_id, payload) = row?;
            let set: SuggestionSet = serde_json::from_str(&payload)?;
            sets.insert(task_id, set);
        }
        Ok(sets)
    }

    fn save(&self, sets: &SuggestionMap) -> Result<(), InfraError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        transaction.execute("DELETE FROM suggestion_sets", [])?;
        for (task_id, set) in sets {
            let payload = serde_json::to_string(set)?;
            transaction.execute(
                "INSERT INTO suggestion_sets (task_id, payload, created_at) VALUES (?1, ?2, ?3)",
                params![task_id, payload, set.created_at.to_rfc3339()],
            )?;
        }
        transaction.commit()?;
        Ok(())
    }

    fn delete(&self, task_id: &str) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(
            "DELETE FROM suggestion_sets WHERE task_id = ?1",
            params![task_id],
        )?;
        Ok(())
    }

    fn load_optimized(&self) -> Result<HashSet<String>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare("SELECT task_id FROM optimized_tasks")?;
        let ids = statement
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    fn mark_optimized(&self, task_id: &str, at: DateTime<Utc>) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO optimized_tasks (task_id, optimized_at)
             VALUES (?1, ?2)
             ON CONFLICT(task_id) DO UPDATE SET optimized_at = excluded.optimized_at",
            params![task_id, at.to_rfc3339()],
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemorySuggestionStore {
    sets: Mutex<SuggestionMap>,
    optimized: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InMemorySuggestionStore {
    fn lock_error(error: impl std::fmt::Display) -> InfraError {
        InfraError::InvalidConfig(format!("suggestion store lock poisoned: {error}"))
    }
}

impl SuggestionStore for InMemorySuggestionStore {
    fn load(&self) -> Result<SuggestionMap, InfraError> {
        let sets = self.sets.lock().map_err(Self::lock_error)?;
        Ok(sets.clone())
    }

    fn save(&self, new_sets: &SuggestionMap) -> Result<(), InfraError> {
        let mut sets = self.sets.lock().map_err(Self::lock_error)?;
        *sets = new_sets.clone();
        Ok(())
    }

    fn delete(&self, task_id: &str) -> Result<(), InfraError> {
        let mut sets = self.sets.lock().map_err(Self::lock_error)?;
        sets.remove(task_id);
        Ok(())
    }

    fn load_optimized(&self) -> Result<HashSet<String>, InfraError> {
        let optimized = self.optimized.lock().map_err(Self::lock_error)?;
        Ok(optimized.keys().cloned().collect())
    }

    fn mark_optimized(&self, task_id: &str, at: DateTime<Utc>) -> Result<(), InfraError> {
        let mut optimized = self.optimized.lock().map_err(Self::lock_error)?;
        optimized.insert(task_id.to_string(), at);
        Ok(())
    }
}

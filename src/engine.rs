//! Query engine abstraction and a script-writing implementation.
//!
//! The engine only ever sees DDL text produced by [`crate::ddl`]. Names
//! passed to the drop and existence calls are physical names; the engine
//! qualifies them with its own database.

use std::{
    collections::BTreeSet,
    fs::OpenOptions,
    io::Write,
    path::PathBuf,
    sync::{LazyLock, Mutex},
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use regex::Regex;

use crate::ddl::quote_identifier;

pub trait QueryEngine: Send + Sync {
    /// Runs one statement, failing when it does not complete within `timeout`.
    fn execute(&self, ddl: &str, timeout: Duration) -> Result<Vec<Vec<String>>>;
    fn table_exists(&self, name: &str) -> Result<bool>;
    fn drop_table(&self, name: &str) -> Result<()>;
    fn drop_view(&self, name: &str) -> Result<()>;
}

static CREATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)^\s*CREATE\s+(EXTERNAL\s+TABLE|VIEW)\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:`[^`]+`\.)?`([^`]+)`",
    )
    .expect("create pattern compiles")
});

#[derive(Debug, Default)]
struct ScriptState {
    statements: Vec<String>,
    tables: BTreeSet<String>,
    views: BTreeSet<String>,
}

/// Records every statement and, when given a path, appends it to a SQL script.
#[derive(Debug)]
pub struct ScriptQueryEngine {
    database: String,
    script: Option<PathBuf>,
    state: Mutex<ScriptState>,
}

impl ScriptQueryEngine {
    pub fn new(database: impl Into<String>, script: Option<PathBuf>) -> Self {
        Self {
            database: database.into(),
            script,
            state: Mutex::new(ScriptState::default()),
        }
    }

    /// Seeds the set of names the engine reports as existing.
    pub fn with_existing(self, tables: &[String], view: Option<&str>) -> Self {
        {
            let mut state = self.lock();
            state.tables.extend(tables.iter().cloned());
            state.views.extend(view.map(str::to_string));
        }
        self
    }

    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    pub fn tables(&self) -> Vec<String> {
        self.lock().tables.iter().cloned().collect()
    }

    pub fn views(&self) -> Vec<String> {
        self.lock().views.iter().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn qualified(&self, name: &str) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.database),
            quote_identifier(name)
        )
    }

    fn record(&self, statement: &str) -> Result<()> {
        if let Some(path) = &self.script {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Opening SQL script {path:?}"))?;
            writeln!(file, "{};\n", statement.trim_end_matches(';'))
                .with_context(|| format!("Writing SQL script {path:?}"))?;
        }
        self.lock().statements.push(statement.to_string());
        Ok(())
    }
}

impl QueryEngine for ScriptQueryEngine {
    fn execute(&self, ddl: &str, timeout: Duration) -> Result<Vec<Vec<String>>> {
        let started = Instant::now();
        self.record(ddl)?;
        if let Some(captures) = CREATE_PATTERN.captures(ddl) {
            let name = captures[2].to_string();
            let mut state = self.lock();
            if captures[1].to_ascii_uppercase().starts_with("VIEW") {
                state.views.insert(name);
            } else {
                state.tables.insert(name);
            }
        }
        let elapsed = started.elapsed();
        if elapsed > timeout {
            return Err(anyhow!(
                "statement exceeded the {} ms timeout",
                timeout.as_millis()
            ));
        }
        debug!("Executed statement in {} ms", elapsed.as_millis());
        Ok(Vec::new())
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        Ok(self.lock().tables.contains(name))
    }

    fn drop_table(&self, name: &str) -> Result<()> {
        self.record(&format!("DROP TABLE IF EXISTS {}", self.qualified(name)))?;
        self.lock().tables.remove(name);
        info!("Dropped table '{name}'");
        Ok(())
    }

    fn drop_view(&self, name: &str) -> Result<()> {
        self.record(&format!("DROP VIEW IF EXISTS {}", self.qualified(name)))?;
        self.lock().views.remove(name);
        info!("Dropped view '{name}'");
        Ok(())
    }
}

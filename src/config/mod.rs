//! Key-value configuration storage backed by SQLite, and the typed
//! [`Settings`] resolved from it.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::consts::{DEFAULT_READY_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
use crate::session::SessionOptions;

pub const KEY_TRANSLATOR_COMMAND: &str = "translator.command";
pub const KEY_ENGINE_COMMAND: &str = "engine.command";
pub const KEY_READY_TIMEOUT: &str = "timeout.ready_secs";
pub const KEY_REQUEST_TIMEOUT: &str = "timeout.request_secs";

/// Every key [`Settings::load`] reads.
pub const KNOWN_KEYS: [&str; 4] = [
    KEY_TRANSLATOR_COMMAND,
    KEY_ENGINE_COMMAND,
    KEY_READY_TIMEOUT,
    KEY_REQUEST_TIMEOUT,
];

/// Persistent key-value configuration store.
pub struct Config {
    conn: Mutex<Connection>,
}

impl Config {
    /// Open or create the config table in the given database.
    /// Use `":memory:"` for tests.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open config database")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS config (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .context("failed to create config table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a config value by key.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT value FROM config WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Set a config value (upsert).
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    /// Remove a config key.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM config WHERE key = ?1", [key])?;
        Ok(())
    }

    /// All stored pairs, ordered by key.
    pub fn list(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read config")
    }
}

/// Settings the broker runs with. Empty commands mean "not configured".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub translator_command: Vec<String>,
    pub engine_command: Vec<String>,
    pub ready_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            translator_command: Vec::new(),
            engine_command: Vec::new(),
            ready_timeout: Some(DEFAULT_READY_TIMEOUT),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

impl Settings {
    /// Resolve settings from the store, falling back to defaults for unset keys.
    pub fn load(config: &Config) -> Result<Self> {
        let mut settings = Self::default();
        if let Some(command) = config.get(KEY_TRANSLATOR_COMMAND)? {
            settings.translator_command = split_command(&command);
        }
        if let Some(command) = config.get(KEY_ENGINE_COMMAND)? {
            settings.engine_command = split_command(&command);
        }
        if let Some(secs) = config.get(KEY_READY_TIMEOUT)? {
            settings.ready_timeout = parse_timeout(KEY_READY_TIMEOUT, &secs)?;
        }
        if let Some(secs) = config.get(KEY_REQUEST_TIMEOUT)? {
            settings.request_timeout = parse_timeout(KEY_REQUEST_TIMEOUT, &secs)?;
        }
        Ok(settings)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            ready_timeout: self.ready_timeout,
            request_timeout: self.request_timeout,
        }
    }
}

/// Split a command line on whitespace. No quoting.
pub fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

/// Seconds to a timeout. `0` disables it.
pub fn parse_timeout(key: &str, secs: &str) -> Result<Option<Duration>> {
    let secs: u64 = secs
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a whole number of seconds, got {secs:?}"))?;
    Ok(timeout_from_secs(secs))
}

pub fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

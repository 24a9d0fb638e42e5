//! Lookup of installed apps and their RPC socket paths.
//!
//! The app lifecycle manager owns the `apps` table; the registry only reads
//! it to validate function names and resolve sockets.

use crate::error::EngineResult;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use tracing::{debug, warn};

pub trait AppDirectory: Send + Sync {
    fn is_registered(&self, app: &str) -> bool;
    fn socket_location(&self, app: &str) -> Option<String>;
}

/// Reads `socket_location` from the `apps` table, matching `app_name`
/// first and `app_id` second.
pub struct SqliteAppDirectory {
    conn: Mutex<Connection>,
}

impl SqliteAppDirectory {
    pub fn open<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        debug!("[Registry] Opened app store at {}", path.as_ref().display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Creates the `apps` table when absent. Used by tests and first boot.
    pub fn ensure_schema(&self) -> EngineResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS apps (
                app_id TEXT PRIMARY KEY,
                app_name TEXT NOT NULL,
                socket_location TEXT
            );",
        )?;
        Ok(())
    }

    pub fn insert_app(
        &self,
        app_id: &str,
        app_name: &str,
        socket_location: Option<&str>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR REPLACE INTO apps (app_id, app_name, socket_location) VALUES (?1, ?2, ?3)",
            params![app_id, app_name, socket_location],
        )?;
        Ok(())
    }

    fn lookup(&self, column: &str, app: &str) -> rusqlite::Result<Option<Option<String>>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!("SELECT socket_location FROM apps WHERE {} = ?1 LIMIT 1", column);
        conn.query_row(&sql, params![app], |row| row.get::<_, Option<String>>(0))
            .optional()
    }

    /// Row for `app`: `None` when no row exists, `Some(socket)` otherwise.
    fn find_row(&self, app: &str) -> Option<Option<String>> {
        for column in ["app_name", "app_id"] {
            match self.lookup(column, app) {
                Ok(Some(socket)) => return Some(socket),
                Ok(None) => {}
                Err(e) => {
                    warn!("[Registry] App lookup by {} failed for '{}': {}", column, app, e);
                }
            }
        }
        None
    }
}

impl AppDirectory for SqliteAppDirectory {
    fn is_registered(&self, app: &str) -> bool {
        self.find_row(app).is_some()
    }

    fn socket_location(&self, app: &str) -> Option<String> {
        self.find_row(app)
            .flatten()
            .filter(|socket| !socket.is_empty())
    }
}

/// Map-backed directory for embedding and tests. An app may be registered
/// without a socket.
#[derive(Default)]
pub struct InMemoryAppDirectory {
    apps: RwLock<HashMap<String, Option<String>>>,
}

impl InMemoryAppDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_app(&self, app: impl Into<String>, socket: Option<String>) {
        self.apps
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(app.into(), socket);
    }

    pub fn remove_app(&self, app: &str) -> bool {
        self.apps
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(app)
            .is_some()
    }
}

impl AppDirectory for InMemoryAppDirectory {
    fn is_registered(&self, app: &str) -> bool {
        self.apps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(app)
    }

    fn socket_location(&self, app: &str) -> Option<String> {
        self.apps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(app)
            .cloned()
            .flatten()
    }
}

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[cfg(feature = "sqlite")]
use rusqlite::params;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionFlags {
    pub read: bool,
    pub write: bool,
}

impl PermissionFlags {
    pub const READ_WRITE: PermissionFlags = PermissionFlags {
        read: true,
        write: true,
    };

    pub fn bits(&self) -> u8 {
        (self.read as u8) | ((self.write as u8) << 1)
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            read: bits & 1 != 0,
            write: bits & 2 != 0,
        }
    }
}

/// A permission the process has persisted for a tree or document URI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Grant {
    pub uri: String,
    pub flags: PermissionFlags,
    pub granted_at: u64,
}

impl Grant {
    pub fn new(uri: impl Into<String>, flags: PermissionFlags) -> Self {
        Self {
            uri: uri.into(),
            flags,
            granted_at: now_epoch(),
        }
    }
}

pub trait PermissionStore: Send + Sync {
    fn persist(&mut self, grant: &Grant) -> CoreResult<()>;
    fn release(&mut self, uri: &str) -> CoreResult<()>;
    fn is_persisted(&self, uri: &str) -> CoreResult<bool>;
    fn list(&self) -> CoreResult<Vec<Grant>>;
}

#[derive(Default)]
pub struct MemoryPermissionStore {
    grants: HashMap<String, Grant>,
}

impl PermissionStore for MemoryPermissionStore {
    fn persist(&mut self, grant: &Grant) -> CoreResult<()> {
        self.grants.insert(grant.uri.clone(), grant.clone());
        Ok(())
    }

    fn release(&mut self, uri: &str) -> CoreResult<()> {
        self.grants.remove(uri);
        Ok(())
    }

    fn is_persisted(&self, uri: &str) -> CoreResult<bool> {
        Ok(self.grants.contains_key(uri))
    }

    fn list(&self) -> CoreResult<Vec<Grant>> {
        let mut grants: Vec<Grant> = self.grants.values().cloned().collect();
        grants.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(grants)
    }
}

#[cfg(feature = "sqlite")]
pub struct SqlitePermissionStore {
    pub path: String,
}

#[cfg(feature = "sqlite")]
impl SqlitePermissionStore {
    pub fn new(path: impl Into<String>) -> CoreResult<Self> {
        let store = Self { path: path.into() };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> CoreResult<rusqlite::Connection> {
        rusqlite::Connection::open(&self.path).map_err(|err| CoreError::Storage(err.to_string()))
    }

    fn init(&self) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS grants (
                uri TEXT PRIMARY KEY,
                flags INTEGER NOT NULL,
                granted_at INTEGER NOT NULL
            );
            ",
        )
        .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
impl PermissionStore for SqlitePermissionStore {
    fn persist(&mut self, grant: &Grant) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "
            INSERT INTO grants (uri, flags, granted_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(uri) DO UPDATE SET
                flags=excluded.flags,
                granted_at=excluded.granted_at
            ",
            params![
                grant.uri.as_str(),
                grant.flags.bits() as i64,
                grant.granted_at as i64
            ],
        )
        .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }

    fn release(&mut self, uri: &str) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM grants WHERE uri = ?1", params![uri])
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }

    fn is_persisted(&self, uri: &str) -> CoreResult<bool> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM grants WHERE uri = ?1",
                params![uri],
                |row| row.get(0),
            )
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(count > 0)
    }

    fn list(&self) -> CoreResult<Vec<Grant>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT uri, flags, granted_at FROM grants ORDER BY uri ASC")
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Grant {
                    uri: row.get(0)?,
                    flags: PermissionFlags::from_bits(row.get::<_, i64>(1)? as u8),
                    granted_at: row.get::<_, i64>(2)? as u64,
                })
            })
            .map_err(|err| CoreError::Storage(err.to_string()))?;

        let mut grants = Vec::new();
        for row in rows {
            grants.push(row.map_err(|err| CoreError::Storage(err.to_string()))?);
        }
        Ok(grants)
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

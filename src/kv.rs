use crate::store::{now_rfc3339, Store};
use crate::{PlatformError, Result};
use rusqlite::OptionalExtension;
use std::collections::HashMap;
use std::sync::Arc;

/// Site-scoped key/value store backing the runtime's `db` capability.
///
/// Values are opaque UTF-8 strings; JSON encoding of non-string values is a
/// runtime convention, not enforced here. Every operation is pinned to one
/// `site_id` - there is no interface for cross-site reads.
#[derive(Clone)]
pub struct KvStore {
    store: Arc<Store>,
}

impl KvStore {
    pub fn new(store: Arc<Store>) -> Self {
        KvStore { store }
    }

    pub fn get(&self, site_id: &str, key: &str) -> Result<Option<String>> {
        let reader = self.store.reader().map_err(PlatformError::from)?;
        let value = reader
            .query_row(
                "SELECT value FROM kv_store WHERE site_id = ?1 AND key = ?2",
                [site_id, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set(&self, site_id: &str, key: &str, value: &str) -> Result<()> {
        self.store.writer().execute(
            "INSERT INTO kv_store (site_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (site_id, key) DO UPDATE SET
                 value = excluded.value,
                 updated_at = excluded.updated_at",
            rusqlite::params![site_id, key, value, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn delete(&self, site_id: &str, key: &str) -> Result<()> {
        self.store.writer().execute(
            "DELETE FROM kv_store WHERE site_id = ?1 AND key = ?2",
            [site_id, key],
        )?;
        Ok(())
    }

    /// Remove all rows for a site (site deletion path)
    pub fn purge_site(&self, site_id: &str) -> Result<()> {
        self.store
            .writer()
            .execute("DELETE FROM kv_store WHERE site_id = ?1", [site_id])?;
        Ok(())
    }
}

/// Site-scoped environment variables, exposed to scripts as a read-only
/// snapshot under `process.env`
#[derive(Clone)]
pub struct EnvStore {
    store: Arc<Store>,
}

impl EnvStore {
    pub fn new(store: Arc<Store>) -> Self {
        EnvStore { store }
    }

    /// All variables for a site, loaded once per request
    pub fn snapshot(&self, site_id: &str) -> Result<HashMap<String, String>> {
        let reader = self.store.reader().map_err(PlatformError::from)?;
        let mut stmt = reader.prepare("SELECT name, value FROM env_vars WHERE site_id = ?1")?;
        let rows = stmt.query_map([site_id], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut vars = HashMap::new();
        for row in rows {
            let (name, value): (String, String) = row?;
            vars.insert(name, value);
        }
        Ok(vars)
    }

    pub fn set(&self, site_id: &str, name: &str, value: &str) -> Result<()> {
        if name.is_empty() {
            return Err(PlatformError::BadRequest(
                "env var name is required".to_string(),
            ));
        }
        self.store.writer().execute(
            "INSERT INTO env_vars (site_id, name, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (site_id, name) DO UPDATE SET value = excluded.value",
            rusqlite::params![site_id, name, value],
        )?;
        Ok(())
    }

    pub fn delete(&self, site_id: &str, name: &str) -> Result<()> {
        let removed = self.store.writer().execute(
            "DELETE FROM env_vars WHERE site_id = ?1 AND name = ?2",
            [site_id, name],
        )?;
        if removed == 0 {
            return Err(PlatformError::NotFound(format!(
                "env var {} for site {}",
                name, site_id
            )));
        }
        Ok(())
    }

    /// Remove all rows for a site (site deletion path)
    pub fn purge_site(&self, site_id: &str) -> Result<()> {
        self.store
            .writer()
            .execute("DELETE FROM env_vars WHERE site_id = ?1", [site_id])?;
        Ok(())
    }
}

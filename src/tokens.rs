use crate::store::{now_rfc3339, Store};
use crate::{PlatformError, Result};
use log::{debug, info, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// bcrypt work factor for stored deploy-token hashes
const BCRYPT_COST: u32 = 12;

/// Public view of a deploy token; the hash never leaves the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub id: i64,
    pub name: String,
    pub scopes: Option<String>,
    pub created_at: String,
    pub last_used_at: Option<String>,
}

/// A freshly issued token; `secret` is shown exactly once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedToken {
    pub id: i64,
    pub name: String,
    pub secret: String,
}

/// Deploy-token store: bearer secrets hashed with bcrypt, validated with the
/// constant-time comparator
#[derive(Clone)]
pub struct TokenStore {
    store: Arc<Store>,
}

impl TokenStore {
    pub fn new(store: Arc<Store>) -> Self {
        TokenStore { store }
    }

    /// Issue a new token: 32 random bytes, hex-encoded, bcrypt-hashed.
    /// The raw secret is returned here and never stored.
    pub fn issue(&self, name: &str, scopes: Option<&str>) -> Result<IssuedToken> {
        if name.is_empty() {
            return Err(PlatformError::BadRequest("token name is required".to_string()));
        }

        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let secret = hex::encode(bytes);
        let hash = bcrypt::hash(&secret, BCRYPT_COST)?;

        let writer = self.store.writer();
        writer.execute(
            "INSERT INTO api_keys (name, key_hash, scopes, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![name, hash, scopes, now_rfc3339()],
        )?;
        let id = writer.last_insert_rowid();

        info!("Issued deploy token '{}' (id {})", name, id);
        Ok(IssuedToken {
            id,
            name: name.to_string(),
            secret,
        })
    }

    /// Validate a presented secret against every stored hash.
    ///
    /// Each candidate is checked with the bcrypt comparator, so rejecting an
    /// unknown secret costs the same as rejecting a wrong-but-known one. On
    /// success the token's `last_used_at` is stamped.
    pub fn validate(&self, presented: &str) -> Result<Option<(i64, String)>> {
        let candidates: Vec<(i64, String, String)> = {
            let reader = self.store.reader().map_err(PlatformError::from)?;
            let mut stmt = reader.prepare("SELECT id, name, key_hash FROM api_keys")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        for (id, name, hash) in candidates {
            match bcrypt::verify(presented, &hash) {
                Ok(true) => {
                    self.store.writer().execute(
                        "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
                        rusqlite::params![now_rfc3339(), id],
                    )?;
                    debug!("Token '{}' validated", name);
                    return Ok(Some((id, name)));
                }
                Ok(false) => {}
                Err(e) => {
                    // Corrupt hash row; skip it rather than lock everyone out
                    warn!("Unreadable token hash for id {}: {}", id, e);
                }
            }
        }

        Ok(None)
    }

    /// List all tokens (metadata only)
    pub fn list(&self) -> Result<Vec<TokenInfo>> {
        let reader = self.store.reader().map_err(PlatformError::from)?;
        let mut stmt = reader.prepare(
            "SELECT id, name, scopes, created_at, last_used_at FROM api_keys ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TokenInfo {
                id: row.get(0)?,
                name: row.get(1)?,
                scopes: row.get(2)?,
                created_at: row.get(3)?,
                last_used_at: row.get(4)?,
            })
        })?;

        let mut tokens = Vec::new();
        for row in rows {
            tokens.push(row?);
        }
        Ok(tokens)
    }

    /// Revoke a token by id
    pub fn revoke(&self, id: i64) -> Result<()> {
        let removed = self
            .store
            .writer()
            .execute("DELETE FROM api_keys WHERE id = ?1", [id])?;
        if removed == 0 {
            return Err(PlatformError::NotFound(format!("token {}", id)));
        }
        info!("Revoked deploy token {}", id);
        Ok(())
    }
}

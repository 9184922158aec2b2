use crate::store::{now_rfc3339, Store};
use crate::utils::{sha256_hex, validate_subdomain};
use crate::vfs::mime_for_path;
use crate::{PlatformError, Result, MAX_DEPLOY_BYTES};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Result of a successful deploy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployOutcome {
    pub success: bool,
    pub site: String,
    pub file_count: u64,
    pub size_bytes: u64,
}

/// One row of the append-only deployment ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: i64,
    pub site_id: String,
    pub size_bytes: u64,
    pub file_count: u64,
    pub deployed_by: String,
    pub created_at: String,
}

/// Per-source-IP quota on accepted deploys; in-memory and best effort
pub struct DeployRateLimiter {
    limiter: RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>,
}

impl DeployRateLimiter {
    pub fn new(per_minute: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN));
        DeployRateLimiter {
            limiter: RateLimiter::keyed(quota),
        }
    }

    pub fn check(&self, ip: IpAddr) -> Result<()> {
        self.limiter.check_key(&ip).map_err(|_| {
            PlatformError::RateLimited(format!("too many deploys from {}", ip))
        })
    }
}

/// Canonicalise a ZIP entry name into a VFS path.
///
/// Returns `None` for names that must be silently skipped: absolute paths,
/// backslashes, NUL bytes, or any `..` segment. `.` and empty segments are
/// collapsed.
pub fn sanitize_entry_name(name: &str) -> Option<String> {
    if name.starts_with('/') || name.contains('\\') || name.contains('\0') {
        return None;
    }

    let mut segments = Vec::new();
    for segment in name.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

/// Archive ingestion: validate, unpack, and atomically replace a site's VFS
/// contents, then append a ledger row.
#[derive(Clone)]
pub struct DeployPipeline {
    store: Arc<Store>,
}

struct AcceptedEntry {
    path: String,
    content: Vec<u8>,
    mime_type: String,
}

impl DeployPipeline {
    pub fn new(store: Arc<Store>) -> Self {
        DeployPipeline { store }
    }

    /// Deploy a ZIP archive to a site. All-or-nothing: either the site ends
    /// up holding exactly the accepted entries, or (on any failure) its
    /// previous contents are untouched.
    ///
    /// # Arguments
    /// * `site_name` - Target subdomain label
    /// * `archive` - Raw ZIP bytes
    /// * `deployed_by` - Name of the token that authorised the upload
    pub fn deploy(&self, site_name: &str, archive: &[u8], deployed_by: &str) -> Result<DeployOutcome> {
        validate_subdomain(site_name)?;

        if archive.len() as u64 > MAX_DEPLOY_BYTES {
            return Err(PlatformError::PayloadTooLarge(format!(
                "archive is {} bytes, limit {}",
                archive.len(),
                MAX_DEPLOY_BYTES
            )));
        }

        let entries = self.unpack(site_name, archive)?;
        let file_count = entries.len() as u64;
        let size_bytes: u64 = entries.iter().map(|e| e.content.len() as u64).sum();

        self.replace_site(site_name, &entries)
            .map_err(|e| PlatformError::DeployFailed(e.to_string()))?;
        self.record(site_name, size_bytes, file_count, deployed_by)?;

        info!(
            "Deployed site '{}': {} files, {} bytes (by {})",
            site_name, file_count, size_bytes, deployed_by
        );

        Ok(DeployOutcome {
            success: true,
            site: site_name.to_string(),
            file_count,
            size_bytes,
        })
    }

    fn unpack(&self, site_name: &str, archive: &[u8]) -> Result<Vec<AcceptedEntry>> {
        let mut zip = zip::ZipArchive::new(Cursor::new(archive))?;
        let mut entries = Vec::new();

        for index in 0..zip.len() {
            let mut file = zip.by_index(index)?;
            if file.is_dir() {
                continue;
            }

            let raw_name = file.name().to_string();
            let path = match sanitize_entry_name(&raw_name) {
                Some(path) => path,
                None => {
                    warn!(
                        "Skipping unsafe archive entry {:?} for site '{}'",
                        raw_name, site_name
                    );
                    continue;
                }
            };

            if file.size() > MAX_DEPLOY_BYTES {
                return Err(PlatformError::PayloadTooLarge(format!(
                    "entry '{}' is {} bytes, limit {}",
                    path,
                    file.size(),
                    MAX_DEPLOY_BYTES
                )));
            }

            let mut content = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut content)
                .map_err(|e| PlatformError::DeployFailed(format!("reading '{}': {}", path, e)))?;

            let mime_type = mime_for_path(&path);
            entries.push(AcceptedEntry {
                path,
                content,
                mime_type,
            });
        }

        Ok(entries)
    }

    /// Clean-slate replacement inside one transaction: stale files from a
    /// prior deploy cannot survive, and failures roll everything back.
    fn replace_site(&self, site_name: &str, entries: &[AcceptedEntry]) -> Result<()> {
        let now = now_rfc3339();
        let mut writer = self.store.writer();
        let tx = writer.transaction().map_err(PlatformError::from)?;

        tx.execute("DELETE FROM files WHERE site_id = ?1", [site_name])?;
        for entry in entries {
            let hash = sha256_hex(&entry.content);
            tx.execute(
                "INSERT INTO files (site_id, path, content, size_bytes, mime_type, hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT (site_id, path) DO UPDATE SET
                     content = excluded.content,
                     size_bytes = excluded.size_bytes,
                     mime_type = excluded.mime_type,
                     hash = excluded.hash,
                     updated_at = excluded.updated_at",
                rusqlite::params![
                    site_name,
                    entry.path,
                    entry.content,
                    entry.content.len() as i64,
                    entry.mime_type,
                    hash,
                    now
                ],
            )?;
        }

        tx.commit().map_err(PlatformError::from)?;
        Ok(())
    }

    fn record(&self, site_name: &str, size_bytes: u64, file_count: u64, deployed_by: &str) -> Result<()> {
        self.store.writer().execute(
            "INSERT INTO deployments (site_id, size_bytes, file_count, deployed_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                site_name,
                size_bytes as i64,
                file_count as i64,
                deployed_by,
                now_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Ledger rows, newest first
    pub fn list_deployments(&self) -> Result<Vec<DeploymentRecord>> {
        let reader = self.store.reader().map_err(PlatformError::from)?;
        let mut stmt = reader.prepare(
            "SELECT id, site_id, size_bytes, file_count, deployed_by, created_at
             FROM deployments ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DeploymentRecord {
                id: row.get(0)?,
                site_id: row.get(1)?,
                size_bytes: row.get::<_, i64>(2)? as u64,
                file_count: row.get::<_, i64>(3)? as u64,
                deployed_by: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

use crate::api::AppState;
use crate::store::{now_rfc3339, Store};
use crate::{PlatformError, Result};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use log::{info, warn};
use parking_lot::Mutex;
use rusqlite::OptionalExtension;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const ACCOUNT_KEY: &str = "acme-account";
const CERT_KEY: &str = "cert-pem";
const PRIVATE_KEY_KEY: &str = "key-pem";
const ISSUED_AT_KEY: &str = "issued-at";
const DOMAINS_KEY: &str = "cert-domains";

/// Certificates are re-issued well before the 90-day expiry
const RENEW_AFTER_DAYS: i64 = 60;

fn tls_err<E: std::fmt::Display>(e: E) -> PlatformError {
    PlatformError::TlsError(e.to_string())
}

/// In-memory stash of outstanding HTTP-01 answers, served by the router at
/// `/.well-known/acme-challenge/<token>`
pub struct ChallengeStash {
    answers: Mutex<HashMap<String, String>>,
}

impl Default for ChallengeStash {
    fn default() -> Self {
        Self::new()
    }
}

impl ChallengeStash {
    pub fn new() -> Self {
        ChallengeStash {
            answers: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, token: String, key_auth: String) {
        self.answers.lock().insert(token, key_auth);
    }

    pub fn answer(&self, token: &str) -> Option<String> {
        self.answers.lock().get(token).cloned()
    }

    pub fn remove(&self, token: &str) {
        self.answers.lock().remove(token);
    }
}

/// Opaque `key -> bytes` view over the `certificates` table; everything the
/// ACME adapter persists goes through here
pub struct CertStore {
    store: Arc<Store>,
}

impl CertStore {
    pub fn new(store: Arc<Store>) -> Self {
        CertStore { store }
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let reader = self.store.reader().map_err(PlatformError::from)?;
        let value = reader
            .query_row(
                "SELECT value FROM certificates WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.store.writer().execute(
            "INSERT INTO certificates (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (key) DO UPDATE SET
                 value = excluded.value,
                 updated_at = excluded.updated_at",
            rusqlite::params![key, value, now_rfc3339()],
        )?;
        Ok(())
    }
}

/// Serve the application over TLS, obtaining and renewing the certificate
/// through ACME. A plain HTTP listener on port 80 stays up for HTTP-01
/// answers and unencrypted site traffic.
pub async fn serve_tls(state: AppState, app: Router) -> Result<()> {
    let http_app = app.clone();
    tokio::spawn(async move {
        let http_addr = SocketAddr::from(([0, 0, 0, 0], 80));
        match tokio::net::TcpListener::bind(http_addr).await {
            Ok(listener) => {
                let served = axum::serve(
                    listener,
                    http_app.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .await;
                if let Err(e) = served {
                    warn!("HTTP challenge listener stopped: {}", e);
                }
            }
            Err(e) => warn!("Could not bind HTTP challenge listener on :80: {}", e),
        }
    });

    let (cert_pem, key_pem) = ensure_certificate(&state).await?;
    let rustls = RustlsConfig::from_pem(cert_pem, key_pem)
        .await
        .map_err(tls_err)?;
    spawn_renewal(state.clone(), rustls.clone());

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        crate::api::shutdown_signal().await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(30)));
    });

    axum_server::bind_rustls(state.config.listen_addr(), rustls)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(tls_err)
}

/// Return the cached certificate when it is still fresh and covers the
/// current domain set; otherwise run an issuance
async fn ensure_certificate(state: &AppState) -> Result<(Vec<u8>, Vec<u8>)> {
    let certs = CertStore::new(state.store.clone());
    let domains = certificate_domains(state)?;

    let cached = (
        certs.get(CERT_KEY)?,
        certs.get(PRIVATE_KEY_KEY)?,
        certs.get(ISSUED_AT_KEY)?,
        certs.get(DOMAINS_KEY)?,
    );
    if let (Some(cert), Some(key), Some(issued_at), Some(stored_domains)) = cached {
        let issued_at = String::from_utf8_lossy(&issued_at).into_owned();
        let stored_domains = String::from_utf8_lossy(&stored_domains).into_owned();
        if !needs_renewal(&issued_at, &stored_domains, &domains) {
            info!("Using cached certificate for {} domain(s)", domains.len());
            return Ok((cert, key));
        }
    }

    issue_certificate(state, &certs, &domains).await
}

/// The apex plus one SAN per deployed site. Sites created later are picked
/// up by the next renewal cycle.
fn certificate_domains(state: &AppState) -> Result<Vec<String>> {
    let mut domains = vec![state.config.domain.clone()];
    for site in state.vfs.list_sites()? {
        domains.push(format!("{}.{}", site.site_id, state.config.domain));
    }
    Ok(domains)
}

fn needs_renewal(issued_at: &str, stored_domains: &str, current_domains: &[String]) -> bool {
    let age_expired = match chrono::DateTime::parse_from_rfc3339(issued_at) {
        Ok(issued) => {
            let age = chrono::Utc::now().signed_duration_since(issued);
            age.num_days() >= RENEW_AFTER_DAYS
        }
        Err(_) => true,
    };
    age_expired || stored_domains != current_domains.join(",")
}

async fn acme_account(state: &AppState, certs: &CertStore) -> Result<Account> {
    if let Some(raw) = certs.get(ACCOUNT_KEY)? {
        if let Ok(credentials) = serde_json::from_slice::<AccountCredentials>(&raw) {
            match Account::from_credentials(credentials).await {
                Ok(account) => return Ok(account),
                Err(e) => warn!("Stored ACME account unusable ({}); creating a new one", e),
            }
        }
    }

    let directory = if state.config.production {
        LetsEncrypt::Production.url()
    } else {
        LetsEncrypt::Staging.url()
    };
    let contact: Vec<String> = state
        .config
        .tls_contact
        .iter()
        .map(|mailbox| format!("mailto:{}", mailbox))
        .collect();
    let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

    let (account, credentials) = Account::create(
        &NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        },
        directory,
        None,
    )
    .await
    .map_err(tls_err)?;

    certs.put(ACCOUNT_KEY, &serde_json::to_vec(&credentials)?)?;
    info!("Registered ACME account at {}", directory);
    Ok(account)
}

async fn issue_certificate(
    state: &AppState,
    certs: &CertStore,
    domains: &[String],
) -> Result<(Vec<u8>, Vec<u8>)> {
    info!("Requesting certificate for {:?}", domains);
    let account = acme_account(state, certs).await?;

    let identifiers: Vec<Identifier> =
        domains.iter().map(|d| Identifier::Dns(d.clone())).collect();
    let mut order = account
        .new_order(&NewOrder {
            identifiers: &identifiers,
        })
        .await
        .map_err(tls_err)?;

    let authorizations = order.authorizations().await.map_err(tls_err)?;
    let mut challenge_tokens = Vec::new();
    for authz in &authorizations {
        match authz.status {
            AuthorizationStatus::Pending => {}
            AuthorizationStatus::Valid => continue,
            status => {
                return Err(PlatformError::TlsError(format!(
                    "authorization in unexpected state {:?}",
                    status
                )))
            }
        }

        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.r#type == ChallengeType::Http01)
            .ok_or_else(|| PlatformError::TlsError("no http-01 challenge offered".to_string()))?;

        let key_auth = order.key_authorization(challenge);
        state
            .acme
            .insert(challenge.token.clone(), key_auth.as_str().to_string());
        challenge_tokens.push(challenge.token.clone());
        order
            .set_challenge_ready(&challenge.url)
            .await
            .map_err(tls_err)?;
    }

    let mut attempts = 0u32;
    let final_status = loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let status = order.refresh().await.map_err(tls_err)?.status;
        match status {
            OrderStatus::Ready | OrderStatus::Valid => break status,
            OrderStatus::Invalid => {
                return Err(PlatformError::TlsError(
                    "order became invalid; check DNS and port 80 reachability".to_string(),
                ))
            }
            _ => {}
        }
        attempts += 1;
        if attempts > 15 {
            return Err(PlatformError::TlsError(
                "timed out waiting for order validation".to_string(),
            ));
        }
    };

    let mut params = rcgen::CertificateParams::new(domains.to_vec()).map_err(tls_err)?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    let key_pair = rcgen::KeyPair::generate().map_err(tls_err)?;
    let csr = params.serialize_request(&key_pair).map_err(tls_err)?;

    if final_status != OrderStatus::Valid {
        order.finalize(csr.der().as_ref()).await.map_err(tls_err)?;
    }

    let cert_pem = loop {
        match order.certificate().await.map_err(tls_err)? {
            Some(pem) => break pem,
            None => tokio::time::sleep(Duration::from_secs(1)).await,
        }
    };

    for token in challenge_tokens {
        state.acme.remove(&token);
    }

    let key_pem = key_pair.serialize_pem();
    certs.put(CERT_KEY, cert_pem.as_bytes())?;
    certs.put(PRIVATE_KEY_KEY, key_pem.as_bytes())?;
    certs.put(ISSUED_AT_KEY, now_rfc3339().as_bytes())?;
    certs.put(DOMAINS_KEY, domains.join(",").as_bytes())?;
    info!("Certificate issued for {} domain(s)", domains.len());

    Ok((cert_pem.into_bytes(), key_pem.into_bytes()))
}

/// Daily renewal check: re-issue when the certificate ages out or the site
/// set changed, then hot-swap the listener's TLS config
fn spawn_renewal(state: AppState, rustls: RustlsConfig) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;

            match ensure_certificate(&state).await {
                Ok((cert_pem, key_pem)) => {
                    if let Err(e) = rustls.reload_from_pem(cert_pem, key_pem).await {
                        warn!("Could not reload TLS config: {}", e);
                    }
                }
                Err(e) => warn!("Certificate renewal failed: {}", e),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_challenge_stash() {
        let stash = ChallengeStash::new();
        assert!(stash.answer("tok").is_none());

        stash.insert("tok".to_string(), "tok.thumbprint".to_string());
        assert_eq!(stash.answer("tok").unwrap(), "tok.thumbprint");

        stash.remove("tok");
        assert!(stash.answer("tok").is_none());
    }

    #[test]
    fn test_cert_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("test.db")).unwrap());
        let certs = CertStore::new(store);

        assert!(certs.get("cert-pem").unwrap().is_none());
        certs.put("cert-pem", b"PEM BYTES").unwrap();
        assert_eq!(certs.get("cert-pem").unwrap().unwrap(), b"PEM BYTES");

        certs.put("cert-pem", b"NEW BYTES").unwrap();
        assert_eq!(certs.get("cert-pem").unwrap().unwrap(), b"NEW BYTES");
    }

    #[test]
    fn test_needs_renewal() {
        let domains = vec!["example.com".to_string(), "demo.example.com".to_string()];
        let fresh = chrono::Utc::now().to_rfc3339();
        let old = (chrono::Utc::now() - chrono::Duration::days(61)).to_rfc3339();

        assert!(!needs_renewal(&fresh, "example.com,demo.example.com", &domains));
        assert!(needs_renewal(&old, "example.com,demo.example.com", &domains));
        assert!(needs_renewal(&fresh, "example.com", &domains));
        assert!(needs_renewal("not-a-date", "example.com,demo.example.com", &domains));
    }
}

use crate::{PlatformError, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Subdomain labels that can never be claimed by a tenant site
pub const RESERVED_SUBDOMAINS: &[&str] = &[
    "www", "api", "admin", "mail", "ftp", "ns1", "ns2", "localhost",
];

/// Calculate SHA-256 hash of the given data
///
/// # Arguments
/// * `data` - The data to hash
///
/// # Returns
/// * `String` - The hex-encoded hash
///
/// # Example
/// ```
/// use cartridge::utils::sha256_hex;
///
/// let hash = sha256_hex("<h1>Hi</h1>");
/// assert_eq!(hash.len(), 64); // SHA-256 produces 32 bytes = 64 hex chars
/// ```
pub fn sha256_hex<T: AsRef<[u8]>>(data: T) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    hex::encode(hasher.finalize())
}

/// Validate a subdomain label for use as a site id
///
/// Labels must match `[a-z0-9]([a-z0-9-]*[a-z0-9])?`, be 1-63 characters
/// long, and not collide with a reserved label.
///
/// # Arguments
/// * `label` - The candidate subdomain label
///
/// # Returns
/// * `Result<()>` - Ok when the label is usable as a site id
///
/// # Example
/// ```
/// use cartridge::utils::validate_subdomain;
///
/// assert!(validate_subdomain("my-site").is_ok());
/// assert!(validate_subdomain("admin").is_err());
/// assert!(validate_subdomain("A_B").is_err());
/// ```
pub fn validate_subdomain(label: &str) -> Result<()> {
    if label.is_empty() || label.len() > 63 {
        return Err(PlatformError::BadRequest(format!(
            "subdomain must be 1-63 characters, got {}",
            label.len()
        )));
    }

    let bytes = label.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return Err(PlatformError::BadRequest(format!(
            "subdomain '{}' must start and end with a lowercase letter or digit",
            label
        )));
    }
    if !bytes.iter().all(|&b| alnum(b) || b == b'-') {
        return Err(PlatformError::BadRequest(format!(
            "subdomain '{}' may only contain lowercase letters, digits and hyphens",
            label
        )));
    }

    if RESERVED_SUBDOMAINS.contains(&label) {
        return Err(PlatformError::BadRequest(format!(
            "subdomain '{}' is reserved",
            label
        )));
    }

    Ok(())
}

/// Generate an 8-byte hex request id for tracing
pub fn request_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_vector() {
        // SHA-256 of the empty string
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_valid_subdomains() {
        for label in ["demo", "a", "my-site", "x9", "a1-b2-c3", "chat"] {
            assert!(validate_subdomain(label).is_ok(), "expected ok: {}", label);
        }
    }

    #[test]
    fn test_invalid_subdomains() {
        for label in [
            "", "A_B", "a.b", "-lead", "trail-", "UPPER", "has space", "admin", "www", "api",
            "localhost",
        ] {
            assert!(
                validate_subdomain(label).is_err(),
                "expected err: {}",
                label
            );
        }
    }

    #[test]
    fn test_subdomain_length_limit() {
        let long = "a".repeat(63);
        assert!(validate_subdomain(&long).is_ok());
        let too_long = "a".repeat(64);
        assert!(validate_subdomain(&too_long).is_err());
    }

    #[test]
    fn test_request_id_shape() {
        let id = request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

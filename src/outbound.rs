use crate::{FETCH_MAX_RESPONSE_BYTES, FETCH_TIMEOUT};
use futures_util::StreamExt;
use log::debug;
use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};
use url::{Host, Url};

/// Options accepted by the script-facing `fetch` capability
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub method: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// Successful outbound response, truncated to the body cap
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Outbound HTTP client for scripts. Blocking from the caller's point of
/// view; dispatched on the shared async runtime.
///
/// Every failure is returned as an in-band message (the script sees an
/// `{error}` record, never an exception).
#[derive(Clone)]
pub struct OutboundClient {
    client: reqwest::Client,
    handle: tokio::runtime::Handle,
}

/// Addresses scripts may never reach: loopback, RFC 1918, link-local,
/// unique-local, unspecified, and IPv4-mapped forms of the same
pub fn is_forbidden_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_forbidden_ip(IpAddr::V4(mapped));
            }
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (segments[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Whether a URL host must be refused before any connection is attempted.
/// Literal internal names and addresses are rejected outright; other names
/// go through best-effort DNS resolution and are rejected when any resolved
/// address is forbidden.
fn host_is_blocked(host: &Host<&str>, port: u16) -> bool {
    match host {
        Host::Ipv4(addr) => is_forbidden_ip(IpAddr::V4(*addr)),
        Host::Ipv6(addr) => is_forbidden_ip(IpAddr::V6(*addr)),
        Host::Domain(name) => {
            let name = name.to_ascii_lowercase();
            if name == "localhost" || name.ends_with(".localhost") || name == "0.0.0.0" {
                return true;
            }
            match (name.as_str(), port).to_socket_addrs() {
                Ok(addrs) => addrs.into_iter().any(|addr| is_forbidden_ip(addr.ip())),
                // Unresolvable hosts fail later at connect time
                Err(_) => false,
            }
        }
    }
}

impl OutboundClient {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        OutboundClient { client, handle }
    }

    /// Perform one outbound request on behalf of a script.
    ///
    /// Blocks the calling (script worker) thread until the response arrives,
    /// the 5 s timeout fires, or the target is refused.
    pub fn fetch_blocking(
        &self,
        url_str: &str,
        options: FetchOptions,
    ) -> Result<FetchResponse, String> {
        let url = Url::parse(url_str).map_err(|e| format!("Invalid URL: {}", e))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(format!("Invalid URL: unsupported scheme '{}'", url.scheme()));
        }

        let host = url
            .host()
            .ok_or_else(|| format!("Invalid URL: missing host in '{}'", url_str))?;
        let port = url.port_or_known_default().unwrap_or(80);
        if host_is_blocked(&host, port) {
            debug!("Refusing outbound fetch to {}", url_str);
            return Err("Blocked: internal/localhost URLs not allowed".to_string());
        }

        let method = match &options.method {
            Some(m) => reqwest::Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|_| format!("Invalid method: {}", m))?,
            None => reqwest::Method::GET,
        };

        let mut request = self.client.request(method, url);
        for (name, value) in &options.headers {
            request = request.header(name, value);
        }
        if let Some(body) = options.body {
            request = request.body(body);
        }

        self.handle.block_on(async move {
            let send = async {
                let response = request
                    .send()
                    .await
                    .map_err(|e| format!("Request failed: {}", e))?;

                let status = response.status().as_u16();
                let mut headers = HashMap::new();
                for (name, value) in response.headers() {
                    headers
                        .entry(name.as_str().to_string())
                        .or_insert_with(|| value.to_str().unwrap_or_default().to_string());
                }

                // Stream the body up to the cap; the remainder is discarded
                let mut body = Vec::new();
                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| format!("Request failed: {}", e))?;
                    let remaining = FETCH_MAX_RESPONSE_BYTES - body.len();
                    if chunk.len() >= remaining {
                        body.extend_from_slice(&chunk[..remaining]);
                        break;
                    }
                    body.extend_from_slice(&chunk);
                }

                Ok(FetchResponse {
                    status,
                    headers,
                    body: String::from_utf8_lossy(&body).into_owned(),
                })
            };

            match tokio::time::timeout(FETCH_TIMEOUT, send).await {
                Ok(result) => result,
                Err(_) => Err("Request failed: timed out".to_string()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_forbidden_ipv4() {
        for ip in [
            "127.0.0.1",
            "127.8.8.8",
            "10.0.0.1",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "169.254.0.1",
            "0.0.0.0",
        ] {
            let ip: Ipv4Addr = ip.parse().unwrap();
            assert!(is_forbidden_ip(IpAddr::V4(ip)), "should block {}", ip);
        }
    }

    #[test]
    fn test_allowed_ipv4() {
        for ip in ["93.184.216.34", "8.8.8.8", "172.32.0.1", "1.1.1.1"] {
            let ip: Ipv4Addr = ip.parse().unwrap();
            assert!(!is_forbidden_ip(IpAddr::V4(ip)), "should allow {}", ip);
        }
    }

    #[test]
    fn test_forbidden_ipv6() {
        for ip in ["::1", "::", "fc00::1", "fd12:3456::1", "fe80::1", "::ffff:127.0.0.1", "::ffff:10.0.0.1"] {
            let ip: Ipv6Addr = ip.parse().unwrap();
            assert!(is_forbidden_ip(IpAddr::V6(ip)), "should block {}", ip);
        }
        let public: Ipv6Addr = "2606:2800:220:1::1".parse().unwrap();
        assert!(!is_forbidden_ip(IpAddr::V6(public)));
    }

    fn test_client() -> OutboundClient {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let handle = runtime.handle().clone();
        // Leak the runtime so the handle stays valid for the test duration
        std::mem::forget(runtime);
        OutboundClient::new(handle)
    }

    #[test]
    fn test_fetch_blocks_localhost_literals() {
        let client = test_client();
        for url in [
            "http://localhost:8080/",
            "http://127.0.0.1:22",
            "http://[::1]/",
            "http://0.0.0.0/",
            "http://10.0.0.5/admin",
            "http://sub.localhost/x",
        ] {
            let err = client
                .fetch_blocking(url, FetchOptions::default())
                .unwrap_err();
            assert!(
                err.contains("Blocked"),
                "expected block for {}, got {}",
                url,
                err
            );
        }
    }

    #[test]
    fn test_fetch_invalid_url() {
        let client = test_client();
        let err = client
            .fetch_blocking("not a url", FetchOptions::default())
            .unwrap_err();
        assert!(err.starts_with("Invalid URL:"), "got {}", err);

        let err = client
            .fetch_blocking("ftp://example.com/x", FetchOptions::default())
            .unwrap_err();
        assert!(err.contains("unsupported scheme"));
    }
}

//! SSRF-guarded download of remote media.
//!
//! Provider responses frequently hand back URLs rather than bytes. Those
//! URLs come from a third party, so before connecting we resolve the host
//! ourselves and refuse anything that lands in loopback, private, link-local
//! or otherwise non-public address space. Redirects are followed manually so
//! every hop gets the same treatment, and bodies are streamed against a hard
//! size cap instead of being buffered blindly.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::redirect::Policy;
use reqwest::{Client, Url};
use tokio::net::lookup_host;

use crate::error::GenError;

/// Maximum redirect hops followed when fetching remote media.
pub const MAX_REDIRECTS: usize = 3;

/// Default cap on a single downloaded payload.
pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 20 * 1024 * 1024;

/// Settings for outbound fetches.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Optional proxy URL applied to all outbound requests.
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Hard cap on downloaded payload size.
    pub max_download_bytes: u64,
    /// Hosts exempt from address-space validation, e.g. a trusted CDN or
    /// a local test server.
    pub trusted_hosts: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
            trusted_hosts: Vec::new(),
        }
    }
}

/// Bytes pulled from a validated remote URL.
#[derive(Debug)]
pub struct FetchedPayload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    /// URL the payload was ultimately served from, after redirects.
    pub final_url: String,
}

/// HTTP client that validates destination addresses before connecting.
#[derive(Debug, Clone)]
pub struct SafeFetcher {
    client: Client,
    max_download_bytes: u64,
    trusted_hosts: Vec<String>,
}

impl SafeFetcher {
    pub fn new(config: &NetworkConfig) -> Result<Self, GenError> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            // Redirects are followed by hand in `fetch` so each hop can be
            // re-validated against forbidden address ranges.
            .redirect(Policy::none());
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).map_err(GenError::Http)?);
        }
        Ok(Self {
            client: builder.build().map_err(GenError::Http)?,
            max_download_bytes: config.max_download_bytes,
            trusted_hosts: config.trusted_hosts.clone(),
        })
    }

    /// Download `url` into memory, validating every hop and enforcing the
    /// payload size cap on both the declared and the actual length.
    pub async fn fetch(&self, url: &str) -> Result<FetchedPayload, GenError> {
        let mut current = url.to_string();
        for _ in 0..=MAX_REDIRECTS {
            let parsed = self.validate_url(&current).await?;
            let response = self
                .client
                .get(parsed)
                .send()
                .await
                .map_err(GenError::from_reqwest)?;

            if response.status().is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| GenError::Api {
                        message: format!("redirect from {current} without Location header"),
                    })?;
                let base = Url::parse(&current).map_err(|e| GenError::Api {
                    message: format!("invalid url {current}: {e}"),
                })?;
                current = base
                    .join(location)
                    .map_err(|e| GenError::Api {
                        message: format!("invalid redirect target {location}: {e}"),
                    })?
                    .to_string();
                continue;
            }

            if !response.status().is_success() {
                return Err(GenError::Api {
                    message: format!("download from {current} failed: HTTP {}", response.status()),
                });
            }

            if let Some(declared) = response.content_length() {
                if declared > self.max_download_bytes {
                    return Err(GenError::PayloadTooLarge {
                        limit_bytes: self.max_download_bytes,
                    });
                }
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned);

            let mut bytes = Vec::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(GenError::from_reqwest)?;
                if bytes.len() as u64 + chunk.len() as u64 > self.max_download_bytes {
                    return Err(GenError::PayloadTooLarge {
                        limit_bytes: self.max_download_bytes,
                    });
                }
                bytes.extend_from_slice(&chunk);
            }

            log::debug!("fetched {} bytes from {current}", bytes.len());
            return Ok(FetchedPayload {
                bytes,
                content_type,
                final_url: current,
            });
        }
        Err(GenError::UnsafeTarget {
            url: url.to_string(),
            reason: format!("more than {MAX_REDIRECTS} redirects"),
        })
    }

    /// Parse and validate a URL, resolving its host and rejecting targets
    /// in non-public address space. Returns the parsed URL on success.
    pub async fn validate_url(&self, url: &str) -> Result<Url, GenError> {
        let parsed = Url::parse(url).map_err(|e| GenError::UnsafeTarget {
            url: url.to_string(),
            reason: format!("unparseable url: {e}"),
        })?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(GenError::UnsafeTarget {
                    url: url.to_string(),
                    reason: format!("scheme {other} not allowed"),
                })
            }
        }

        let host = parsed.host_str().ok_or_else(|| GenError::UnsafeTarget {
            url: url.to_string(),
            reason: "missing host".into(),
        })?;

        if self.is_trusted_host(host) {
            return Ok(parsed);
        }

        // A literal IP skips DNS but still gets range-checked.
        if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
            return if let Some(reason) = forbidden_range(ip) {
                Err(GenError::UnsafeTarget {
                    url: url.to_string(),
                    reason,
                })
            } else {
                Ok(parsed)
            };
        }

        let port = parsed.port_or_known_default().unwrap_or(443);
        let addrs: Vec<_> = lookup_host((host, port))
            .await
            .map_err(|e| GenError::UnsafeTarget {
                url: url.to_string(),
                reason: format!("dns resolution failed: {e}"),
            })?
            .collect();
        if addrs.is_empty() {
            return Err(GenError::UnsafeTarget {
                url: url.to_string(),
                reason: "dns returned no addresses".into(),
            });
        }
        for addr in addrs {
            if let Some(reason) = forbidden_range(addr.ip()) {
                return Err(GenError::UnsafeTarget {
                    url: url.to_string(),
                    reason: format!("{host} resolves to {}: {reason}", addr.ip()),
                });
            }
        }
        Ok(parsed)
    }

    fn is_trusted_host(&self, host: &str) -> bool {
        self.trusted_hosts
            .iter()
            .any(|t| t.eq_ignore_ascii_case(host))
    }
}

/// Reason `ip` must not be fetched, or `None` when it is publicly routable.
fn forbidden_range(ip: IpAddr) -> Option<String> {
    match ip {
        IpAddr::V4(v4) => forbidden_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return forbidden_v4(mapped);
            }
            forbidden_v6(v6)
        }
    }
}

fn forbidden_v4(ip: Ipv4Addr) -> Option<String> {
    if ip.is_unspecified() {
        Some("unspecified address".into())
    } else if ip.is_loopback() {
        Some("loopback address".into())
    } else if ip.is_private() {
        Some("private address".into())
    } else if ip.is_link_local() {
        Some("link-local address".into())
    } else if ip.is_broadcast() {
        Some("broadcast address".into())
    } else if ip.is_multicast() {
        Some("multicast address".into())
    } else if ip.octets()[0] == 100 && (ip.octets()[1] & 0xc0) == 64 {
        // 100.64.0.0/10, carrier-grade NAT
        Some("shared address space".into())
    } else {
        None
    }
}

fn forbidden_v6(ip: Ipv6Addr) -> Option<String> {
    if ip.is_unspecified() {
        Some("unspecified address".into())
    } else if ip.is_loopback() {
        Some("loopback address".into())
    } else if ip.is_multicast() {
        Some("multicast address".into())
    } else if (ip.segments()[0] & 0xfe00) == 0xfc00 {
        // fc00::/7, unique local addresses
        Some("unique local address".into())
    } else if (ip.segments()[0] & 0xffc0) == 0xfe80 {
        // fe80::/10
        Some("link-local address".into())
    } else {
        None
    }
}

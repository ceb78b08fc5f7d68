//! Link negotiation with the remote backup service.
//!
//! A single HTTP request/response boundary: send the public key and the
//! requested computer name, get back a link token and the identity of the
//! backup host. A name collision and bad credentials are distinct,
//! user-correctable conditions; everything else is a transport failure.
//! Retry policy belongs to the controller, never here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use ankor_core::error::{LinkError, Result};

/// Account credentials used for the exchange. Never persisted.
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Reply of a successful key exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeReply {
    /// Remote-assigned link token.
    pub token: String,
    /// Hostname of the backup target the schedule will talk to.
    pub remote_host: String,
    /// Fingerprint of the backup host's key, as observed by the service
    /// boundary. Input to trust evaluation.
    pub host_fingerprint: String,
}

#[derive(Debug, Serialize)]
struct ExchangeBody<'a> {
    computername: &'a str,
    public_key: &'a str,
}

/// Capability interface over the remote linking service.
pub trait LinkService {
    /// Exchange the public key and bind `computer_name` to the account.
    /// Exactly one attempt per call.
    fn exchange_key(
        &self,
        public_key: &str,
        computer_name: &str,
        credentials: &Credentials,
    ) -> Result<ExchangeReply>;

    /// Revoke a previously issued link token. Called during unlink.
    fn revoke(&self, token: &str) -> Result<()>;
}

/// HTTP client for the remote linking service.
#[derive(Debug)]
pub struct LinkServiceClient {
    http: reqwest::blocking::Client,
    base_url: String,
}

impl LinkServiceClient {
    /// Create a client for the service at `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        if base_url.is_empty() {
            return Err(LinkError::MissConfigured {
                message: "remote service URL is empty".into(),
                source: None,
            });
        }
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LinkError::ExchangeKey {
                source: Box::new(e),
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api{path}", self.base_url)
    }
}

impl LinkService for LinkServiceClient {
    fn exchange_key(
        &self,
        public_key: &str,
        computer_name: &str,
        credentials: &Credentials,
    ) -> Result<ExchangeReply> {
        tracing::info!(computer_name, "exchanging public key with remote service");
        let resp = self
            .http
            .post(self.api_url("/link"))
            .basic_auth(&credentials.username, Some(&credentials.password))
            .json(&ExchangeBody {
                computername: computer_name,
                public_key,
            })
            .send()
            .map_err(|e| LinkError::ExchangeKey {
                source: Box::new(e),
            })?;

        let status = resp.status();
        match status.as_u16() {
            409 => Err(LinkError::ComputerNameAlreadyInUse {
                name: computer_name.to_string(),
            }),
            401 | 403 => Err(LinkError::AuthenticationFailed),
            _ if !status.is_success() => Err(LinkError::ExchangeKey {
                source: Box::new(std::io::Error::other(format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                ))),
            }),
            _ => resp.json().map_err(|e| LinkError::ExchangeKey {
                source: Box::new(e),
            }),
        }
    }

    fn revoke(&self, token: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.api_url("/link"))
            .bearer_auth(token)
            .send()
            .map_err(|e| LinkError::ExchangeKey {
                source: Box::new(e),
            })?;
        let status = resp.status();
        if status.is_success() || status.as_u16() == 404 {
            // 404 means the token is already gone, which is what we want.
            Ok(())
        } else {
            Err(LinkError::ExchangeKey {
                source: Box::new(std::io::Error::other(format!(
                    "HTTP {} while revoking link token",
                    status.as_u16()
                ))),
            })
        }
    }
}

//! Credential resolution for remote hosts, modeled on the Python
//! original's `ConfigManager.get_credentials()` four-step fallback chain:
//! secret store, per-host environment variables, inline config (warned
//! against), then default environment variables.

use crate::error::{Result, SentinelError};
use crate::model::HostTarget;
use crate::transport::Credentials;
use std::collections::HashMap;
use tracing::warn;

const SERVICE_NAME: &str = "HeadlessSentinel";

/// Resolves plaintext credentials for a host. The spec treats this purely
/// as a contract: the provider may consult a secret store, environment, or
/// config, and callers must be able to exercise the pipeline against a
/// fixed stand-in without touching any of those.
pub trait CredentialProvider: Send + Sync {
    fn resolve(&self, host_ip: &str) -> Result<Credentials>;
}

/// Always returns the same credentials, regardless of host. Used in tests
/// and for the `SENTINEL_DEFAULT_*` fallback.
pub struct StaticCredentialProvider {
    credentials: Credentials,
}

impl StaticCredentialProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn resolve(&self, _host_ip: &str) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }
}

/// The production resolver: tries, in order —
/// 1. the OS secret store (service `HeadlessSentinel`, keys `<ip>_username`/`<ip>_password`),
/// 2. `SENTINEL_<ip_with_dots_as_underscores>_USERNAME`/`_PASSWORD`,
/// 3. credentials embedded inline in the host's config entry (warns),
/// 4. `SENTINEL_DEFAULT_USERNAME`/`SENTINEL_DEFAULT_PASSWORD` (warns),
///
/// returning `CredentialError` if none of the four yield a complete pair.
pub struct ChainCredentialProvider {
    inline: HashMap<String, Credentials>,
}

impl ChainCredentialProvider {
    /// `hosts` supplies each target's inline credentials (step 3), keyed by
    /// IP, so the chain doesn't need to re-parse config itself.
    pub fn new(hosts: &[HostTarget]) -> Self {
        let inline = hosts
            .iter()
            .filter_map(|h| {
                h.credentials.as_ref().map(|c| {
                    (
                        h.ip.clone(),
                        Credentials {
                            username: c.username.clone(),
                            password: c.password.clone(),
                        },
                    )
                })
            })
            .collect();
        Self { inline }
    }

    fn from_keyring(&self, host_ip: &str) -> Option<Credentials> {
        let entry_user = keyring::Entry::new(SERVICE_NAME, &format!("{host_ip}_username")).ok()?;
        let entry_pass = keyring::Entry::new(SERVICE_NAME, &format!("{host_ip}_password")).ok()?;
        let username = entry_user.get_password().ok()?;
        let password = entry_pass.get_password().ok()?;
        Some(Credentials { username, password })
    }

    fn from_host_env(&self, host_ip: &str) -> Option<Credentials> {
        let key = host_ip.replace('.', "_");
        let username = std::env::var(format!("SENTINEL_{key}_USERNAME")).ok()?;
        let password = std::env::var(format!("SENTINEL_{key}_PASSWORD")).ok()?;
        Some(Credentials { username, password })
    }

    fn from_inline(&self, host_ip: &str) -> Option<Credentials> {
        self.inline.get(host_ip).cloned()
    }

    fn from_default_env(&self) -> Option<Credentials> {
        let username = std::env::var("SENTINEL_DEFAULT_USERNAME").ok()?;
        let password = std::env::var("SENTINEL_DEFAULT_PASSWORD").ok()?;
        Some(Credentials { username, password })
    }
}

impl CredentialProvider for ChainCredentialProvider {
    fn resolve(&self, host_ip: &str) -> Result<Credentials> {
        if let Some(c) = self.from_keyring(host_ip) {
            return Ok(c);
        }
        if let Some(c) = self.from_host_env(host_ip) {
            return Ok(c);
        }
        if let Some(c) = self.from_inline(host_ip) {
            warn!(host = %host_ip, "using credentials embedded in config; prefer the secret store");
            return Ok(c);
        }
        if let Some(c) = self.from_default_env() {
            warn!(host = %host_ip, "falling back to SENTINEL_DEFAULT_* credentials");
            return Ok(c);
        }

        Err(SentinelError::Credential {
            host: host_ip.to_string(),
        })
    }
}

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;
use sha2::{Digest, Sha256};

use kitsu_core::{DomainError, DomainResult};

const IP_FALLBACK_LEN: usize = 8;

/// Scope-qualified rate-limit key: `<scope>:<ip>:<sha256(identity)>`.
///
/// The identity is only ever stored hashed. The IP component is the canonical
/// form of a parsed [`IpAddr`]; when the client IP is missing or does not
/// parse, a stable `unknown-ip-<hash prefix>` stands in. Either way the key
/// length is bounded whatever the caller passes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    pub fn derive(scope: &str, identity: &str, client_ip: Option<&str>) -> DomainResult<Self> {
        if identity.is_empty() {
            return Err(DomainError::validation("identity is required for rate limiting"));
        }
        if scope.is_empty() || scope.contains(':') {
            return Err(DomainError::validation(format!("invalid rate-limit scope: {scope:?}")));
        }

        let digest = hex::encode(Sha256::digest(identity.as_bytes()));
        let ip = match client_ip.and_then(|ip| ip.trim().parse::<IpAddr>().ok()) {
            Some(ip) => ip.to_string(),
            None => format!("unknown-ip-{}", &digest[..IP_FALLBACK_LEN]),
        };

        Ok(Self(format!("{scope}:{ip}:{digest}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn scope(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RateLimitKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

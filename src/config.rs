use std::env;
use std::time::Duration;

use crate::error::RelayError;

const DEFAULT_ISSUER_BASE: &str = "https://rtc.live.cloudflare.com/v1";
const DEFAULT_CREDENTIAL_TTL: u64 = 86_400;
const DEFAULT_KEYFRAME_INTERVAL: Duration = Duration::from_secs(3);

/// Runtime configuration, built once at startup from the environment and
/// passed by reference to the credential broker and the session controller.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base URL of the credential-issuing API
    pub issuer_base_url: String,
    /// TURN key identifier, interpolated into the credential endpoint path
    pub relay_key_id: String,
    /// Bearer token for the credential-issuing API
    pub api_token: String,
    /// Requested credential lifetime in seconds
    pub credential_ttl: u64,
    /// How often a keyframe is requested from the sending peer
    pub keyframe_interval: Duration,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    ///
    /// `CLOUDFLARE_API_TOKEN` and `TURN_TOKEN` are required; the API base and
    /// credential TTL can be overridden with `CLOUDFLARE_API_BASE` and
    /// `TURN_CREDENTIAL_TTL`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_token = required(&lookup, "CLOUDFLARE_API_TOKEN")?;
        let relay_key_id = required(&lookup, "TURN_TOKEN")?;

        let issuer_base_url = lookup("CLOUDFLARE_API_BASE")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ISSUER_BASE.to_string());

        let credential_ttl = match lookup("TURN_CREDENTIAL_TTL") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|_| RelayError::Config(format!("TURN_CREDENTIAL_TTL is not a number: {raw:?}")))?,
            None => DEFAULT_CREDENTIAL_TTL,
        };

        Ok(RelayConfig {
            issuer_base_url,
            relay_key_id,
            api_token,
            credential_ttl,
            keyframe_interval: DEFAULT_KEYFRAME_INTERVAL,
        })
    }
}

fn required<F>(lookup: &F, key: &str) -> Result<String, RelayError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RelayError::Config(format!("{key} must be set")))
}

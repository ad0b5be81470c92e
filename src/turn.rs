//! Short-lived TURN credential brokering.
//!
//! One POST to the issuing API per process run, before any transport object
//! exists. There is no caching and no retry; a failed fetch ends the run.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RelayConfig;
use crate::error::RelayError;

/// ICE server urls plus the username/credential pair granted for them.
#[derive(Debug, Clone)]
pub struct RelayCredentials {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[derive(Serialize)]
struct CredentialRequest {
    ttl: u64,
}

#[derive(Deserialize)]
struct CredentialResponse {
    #[serde(rename = "iceServers")]
    ice_servers: IceServerGrant,
}

#[derive(Deserialize)]
struct IceServerGrant {
    urls: Vec<String>,
    username: String,
    credential: String,
}

/// Request fresh relay credentials from the issuing API.
///
/// Only HTTP 201 counts as success. Any other status, a transport error or a
/// malformed response body is fatal for the call; the returned credentials
/// are guaranteed to be fully populated.
pub async fn fetch_relay_credentials(
    client: &reqwest::Client,
    cfg: &RelayConfig,
) -> Result<RelayCredentials, RelayError> {
    let url = format!(
        "{}/turn/keys/{}/credentials/generate",
        cfg.issuer_base_url, cfg.relay_key_id
    );
    debug!("requesting relay credentials from {url}");

    let response = client
        .post(&url)
        .bearer_auth(&cfg.api_token)
        .json(&CredentialRequest {
            ttl: cfg.credential_ttl,
        })
        .send()
        .await
        .map_err(|e| RelayError::CredentialFetch(e.to_string()))?;

    if response.status() != StatusCode::CREATED {
        return Err(RelayError::CredentialFetch(format!(
            "unexpected status: {}",
            response.status()
        )));
    }

    let body: CredentialResponse = response
        .json()
        .await
        .map_err(|e| RelayError::CredentialFetch(format!("malformed response body: {e}")))?;

    let grant = body.ice_servers;
    if grant.urls.is_empty() || grant.username.is_empty() || grant.credential.is_empty() {
        return Err(RelayError::CredentialFetch(
            "issuer returned incomplete credentials".to_string(),
        ));
    }

    Ok(RelayCredentials {
        urls: grant.urls,
        username: grant.username,
        credential: grant.credential,
    })
}

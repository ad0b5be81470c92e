//! Copy/paste session negotiation.
//!
//! Session descriptions travel between the peers as a single line of text:
//! the description is serialized to JSON and wrapped in standard base64 so it
//! survives terminals and chat clients. The offer is read from an injectable
//! line source so tests can drive negotiation with canned input.

use std::io::{self, BufRead};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::RelayError;

/// Failure to turn a pasted token back into a session description.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("token is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("token does not hold a session description: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize a session description to its transportable token form.
pub fn encode(description: &RTCSessionDescription) -> Result<String, RelayError> {
    let json = serde_json::to_vec(description)
        .map_err(|e| RelayError::Negotiation(format!("serializing description: {e}")))?;
    Ok(STANDARD.encode(json))
}

/// Inverse of [`encode`].
pub fn decode(token: &str) -> Result<RTCSessionDescription, DecodeError> {
    let json = STANDARD.decode(token)?;
    Ok(serde_json::from_slice(&json)?)
}

/// A line-oriented source of the remote peer's offer.
///
/// `read_line` returns `None` at end of input. The production implementation
/// reads the operator's terminal; tests supply scripted lines.
pub trait OfferSource: Send {
    fn read_line(&mut self) -> io::Result<Option<String>>;
}

/// Reads the offer from the process's standard input.
pub struct StdinSource;

impl OfferSource for StdinSource {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        let n = io::stdin().lock().read_line(&mut line)?;
        Ok((n > 0).then_some(line))
    }
}

/// Block until the source produces a non-empty line, trimmed of surrounding
/// whitespace. Blank lines are skipped; end of input before a token arrives
/// is an error.
pub fn read_offer(source: &mut dyn OfferSource) -> Result<String, RelayError> {
    loop {
        match source.read_line() {
            Ok(Some(line)) => {
                let token = line.trim();
                if !token.is_empty() {
                    return Ok(token.to_string());
                }
            }
            Ok(None) => {
                return Err(RelayError::Negotiation(
                    "input closed before an offer was pasted".to_string(),
                ))
            }
            Err(e) => return Err(RelayError::Negotiation(format!("reading offer: {e}"))),
        }
    }
}

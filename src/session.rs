//! Connection lifecycle: negotiation, track wiring and process lifetime.
//!
//! `run` performs the one-shot negotiation sequence with the remote peer and
//! then turns fully reactive: the transport reports connection-state changes
//! and inbound tracks through channels, and the first terminal event decides
//! how the process ends. A `failed` or `closed` connection is the expected
//! end of a session, not an error.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::info;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::media;
use crate::signal::{self, OfferSource};
use crate::turn::{self, RelayCredentials};

fn negotiation_err(e: impl std::fmt::Display) -> RelayError {
    RelayError::Negotiation(e.to_string())
}

/// Run one relay session to completion.
///
/// Fetches fresh TURN credentials, negotiates with the pasted offer, prints
/// the answer token and then stays alive relaying media until the connection
/// reaches a terminal state or the pipeline breaks.
pub async fn run(cfg: &RelayConfig, offer_source: Box<dyn OfferSource>) -> Result<(), RelayError> {
    let http = reqwest::Client::new();
    let credentials = turn::fetch_relay_credentials(&http, cfg).await?;
    info!(
        "acquired relay credentials for {} ice server url(s)",
        credentials.urls.len()
    );

    let connection = build_peer_connection(&credentials).await?;

    // The outbound track exists before any negotiation happens.
    let output_track = media::video_output_track();
    let sender = connection
        .add_track(Arc::clone(&output_track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(negotiation_err)?;
    tokio::spawn(async move { media::drain_feedback(&*sender).await });

    let token = tokio::task::spawn_blocking({
        let mut source = offer_source;
        move || signal::read_offer(source.as_mut())
    })
    .await
    .map_err(negotiation_err)??;
    let offer = signal::decode(&token)?;
    connection
        .set_remote_description(offer)
        .await
        .map_err(negotiation_err)?;

    // Handlers must be in place before the answer exists, otherwise an early
    // inbound track or state transition would be missed.
    let (state_tx, state_rx) = unbounded_channel();
    let (fatal_tx, fatal_rx) = unbounded_channel();
    register_track_handler(&connection, &output_track, fatal_tx, cfg.keyframe_interval);
    register_state_handler(&connection, state_tx);

    let answer = connection
        .create_answer(None)
        .await
        .map_err(negotiation_err)?;

    // Setting the local description starts candidate gathering; the barrier
    // resolves once every local candidate is in the description. No timeout,
    // matching the manual copy/paste workflow.
    let mut gathered = connection.gathering_complete_promise().await;
    connection
        .set_local_description(answer)
        .await
        .map_err(negotiation_err)?;
    let _ = gathered.recv().await;

    let local = connection.local_description().await.ok_or_else(|| {
        RelayError::Negotiation("local description missing after gathering".to_string())
    })?;
    println!();
    println!("{}", signal::encode(&local)?);
    info!("answer printed, paste it into the remote peer");

    let outcome = await_termination(state_rx, fatal_rx).await;
    let _ = connection.close().await;
    outcome
}

/// Assemble the transport with the single relayed codec, the default
/// interceptors and the brokered ICE servers.
async fn build_peer_connection(
    credentials: &RelayCredentials,
) -> Result<Arc<RTCPeerConnection>, RelayError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: media::video_capability(),
                payload_type: media::VIDEO_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(negotiation_err)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(negotiation_err)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: credentials.urls.clone(),
            username: credentials.username.clone(),
            credential: credentials.credential.clone(),
            ..Default::default()
        }],
        ..Default::default()
    };

    let connection = api
        .new_peer_connection(config)
        .await
        .map_err(negotiation_err)?;
    Ok(Arc::new(connection))
}

/// For each newly detected inbound track, start the keyframe requester and
/// the relay loop. A relay failure surfaces on the fatal channel and ends
/// the whole process.
fn register_track_handler(
    connection: &Arc<RTCPeerConnection>,
    output_track: &Arc<TrackLocalStaticRTP>,
    fatal_tx: UnboundedSender<RelayError>,
    keyframe_interval: Duration,
) {
    let connection_weak = Arc::downgrade(connection);
    let output_track = Arc::clone(output_track);

    connection.on_track(Box::new(move |track, _receiver, _transceiver| {
        let output_track = Arc::clone(&output_track);
        let fatal_tx = fatal_tx.clone();
        let connection_weak = connection_weak.clone();

        Box::pin(async move {
            info!(
                "inbound track started: payload type {} ({})",
                track.payload_type(),
                track.codec().capability.mime_type
            );

            tokio::spawn(media::request_keyframes(
                connection_weak,
                track.ssrc(),
                keyframe_interval,
            ));
            tokio::spawn(async move {
                let err = media::relay_rtp(&*track, &*output_track).await;
                let _ = fatal_tx.send(err);
            });
        })
    }));
}

fn register_state_handler(
    connection: &Arc<RTCPeerConnection>,
    state_tx: UnboundedSender<RTCPeerConnectionState>,
) {
    connection.on_peer_connection_state_change(Box::new(move |state| {
        let state_tx = state_tx.clone();
        Box::pin(async move {
            let _ = state_tx.send(state);
        })
    }));
}

/// React to connection-state transitions and pipeline failures.
///
/// Returns `Ok(())` on the first `failed` or `closed` transition, the
/// recognized end of a session. A pipeline failure is returned as the error
/// it is. Earlier transitions are only logged.
async fn await_termination(
    mut state_rx: UnboundedReceiver<RTCPeerConnectionState>,
    mut fatal_rx: UnboundedReceiver<RelayError>,
) -> Result<(), RelayError> {
    loop {
        tokio::select! {
            state = state_rx.recv() => match state {
                Some(state) => {
                    info!("peer connection state changed: {state}");
                    match state {
                        RTCPeerConnectionState::Failed => {
                            info!("peer connection failed, shutting down");
                            return Ok(());
                        }
                        RTCPeerConnectionState::Closed => {
                            info!("peer connection closed, shutting down");
                            return Ok(());
                        }
                        _ => {}
                    }
                }
                None => return Ok(()),
            },
            err = fatal_rx.recv() => match err {
                Some(err) => return Err(err),
                None => return Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminates_once_on_the_failed_transition() {
        let (state_tx, state_rx) = unbounded_channel();
        let (_fatal_tx, fatal_rx) = unbounded_channel::<RelayError>();
        let waiter = tokio::spawn(await_termination(state_rx, fatal_rx));

        for state in [
            RTCPeerConnectionState::New,
            RTCPeerConnectionState::Connecting,
            RTCPeerConnectionState::Connected,
        ] {
            state_tx.send(state).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "non-terminal states must not end the session");

        state_tx.send(RTCPeerConnectionState::Failed).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn closed_is_a_clean_exit_too() {
        let (state_tx, state_rx) = unbounded_channel();
        let (_fatal_tx, fatal_rx) = unbounded_channel::<RelayError>();
        let waiter = tokio::spawn(await_termination(state_rx, fatal_rx));

        state_tx.send(RTCPeerConnectionState::Closed).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn disconnected_alone_keeps_the_session_alive() {
        let (state_tx, state_rx) = unbounded_channel();
        let (_fatal_tx, fatal_rx) = unbounded_channel::<RelayError>();
        let waiter = tokio::spawn(await_termination(state_rx, fatal_rx));

        state_tx.send(RTCPeerConnectionState::Disconnected).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        waiter.abort();
    }

    #[tokio::test]
    async fn pipeline_failure_surfaces_as_the_error() {
        let (_state_tx, state_rx) = unbounded_channel::<RTCPeerConnectionState>();
        let (fatal_tx, fatal_rx) = unbounded_channel();
        let waiter = tokio::spawn(await_termination(state_rx, fatal_rx));

        fatal_tx
            .send(RelayError::RelayIo("inbound track closed".to_string()))
            .unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(RelayError::RelayIo(_))));
    }
}

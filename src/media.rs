//! Media pipeline: the outbound track, the RTP relay loop and the RTCP
//! feedback drain.
//!
//! The relay owns exactly one outbound video track, created before
//! negotiation. Packets from the single inbound track are forwarded to it
//! unchanged and in arrival order, one packet in flight. The transport types
//! sit behind small source/sink traits so the loops can be exercised with
//! scripted channels.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use crate::error::RelayError;

/// RTP payload type advertised for the relayed video stream.
pub const VIDEO_PAYLOAD_TYPE: u8 = 96;
/// RTP clock rate for the relayed video stream.
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// One network-MTU-class RTCP packet.
const FEEDBACK_SCRATCH_LEN: usize = 1500;

/// Codec capability shared by the media engine and the outbound track.
pub fn video_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_owned(),
        clock_rate: VIDEO_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// The locally owned track the relayed packets are written back on.
pub fn video_output_track() -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        video_capability(),
        "video".to_owned(),
        "relay".to_owned(),
    ))
}

/// A stream of inbound RTP packets.
#[async_trait]
pub trait RtpSource: Send + Sync {
    async fn next_packet(&self) -> Result<Packet, RelayError>;
}

/// A destination for relayed RTP packets.
#[async_trait]
pub trait RtpSink: Send + Sync {
    async fn forward_packet(&self, packet: &Packet) -> Result<(), RelayError>;
}

/// A readable RTCP feedback channel.
#[async_trait]
pub trait FeedbackSource: Send + Sync {
    async fn read_feedback(&self, scratch: &mut [u8]) -> Result<usize, RelayError>;
}

#[async_trait]
impl RtpSource for TrackRemote {
    async fn next_packet(&self) -> Result<Packet, RelayError> {
        let (packet, _attributes) = self
            .read_rtp()
            .await
            .map_err(|e| RelayError::RelayIo(format!("reading inbound track: {e}")))?;
        Ok(packet)
    }
}

#[async_trait]
impl RtpSink for TrackLocalStaticRTP {
    async fn forward_packet(&self, packet: &Packet) -> Result<(), RelayError> {
        self.write_rtp(packet)
            .await
            .map(|_| ())
            .map_err(|e| RelayError::RelayIo(format!("writing outbound track: {e}")))
    }
}

#[async_trait]
impl FeedbackSource for RTCRtpSender {
    async fn read_feedback(&self, scratch: &mut [u8]) -> Result<usize, RelayError> {
        self.read(scratch)
            .await
            .map(|(packets, _attributes)| packets.len())
            .map_err(|e| RelayError::RelayIo(e.to_string()))
    }
}

/// Forward packets from `source` to `sink` until either side fails.
///
/// Runs for the lifetime of the inbound track and returns the terminating
/// failure. There is exactly one inbound track of interest, so the caller
/// treats that failure as fatal for the whole session.
pub async fn relay_rtp(source: &dyn RtpSource, sink: &dyn RtpSink) -> RelayError {
    loop {
        let packet = match source.next_packet().await {
            Ok(packet) => packet,
            Err(e) => return e,
        };
        if let Err(e) = sink.forward_packet(&packet).await {
            return e;
        }
    }
}

/// Read and discard sender feedback until the channel is torn down.
///
/// Keeps the feedback channel from backing up; the first read failure means
/// the sender is gone and the loop ends silently.
pub async fn drain_feedback(source: &dyn FeedbackSource) {
    let mut scratch = vec![0u8; FEEDBACK_SCRATCH_LEN];
    while source.read_feedback(&mut scratch).await.is_ok() {}
}

/// Periodically ask the sending peer for a keyframe.
///
/// Emits a PLI for `media_ssrc` every `interval` so the relayed stream
/// recovers from loss without waiting for the receiver to complain. Ends
/// silently once the peer connection is gone.
pub async fn request_keyframes(
    connection: Weak<RTCPeerConnection>,
    media_ssrc: u32,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;

        let Some(connection) = connection.upgrade() else {
            return;
        };
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        if connection.write_rtcp(&[Box::new(pli)]).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use bytes::Bytes;
    use webrtc::rtp::header::Header;

    use super::*;

    fn packet(sequence_number: u16, payload: &'static [u8]) -> Packet {
        Packet {
            header: Header {
                sequence_number,
                timestamp: u32::from(sequence_number) * 3000,
                payload_type: VIDEO_PAYLOAD_TYPE,
                ..Default::default()
            },
            payload: Bytes::from_static(payload),
        }
    }

    struct ScriptedSource(Mutex<VecDeque<Result<Packet, RelayError>>>);

    impl ScriptedSource {
        fn new(items: Vec<Result<Packet, RelayError>>) -> Self {
            Self(Mutex::new(items.into()))
        }
    }

    #[async_trait]
    impl RtpSource for ScriptedSource {
        async fn next_packet(&self) -> Result<Packet, RelayError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(RelayError::RelayIo("source exhausted".to_string())))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        written: Mutex<Vec<Packet>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl RtpSink for RecordingSink {
        async fn forward_packet(&self, packet: &Packet) -> Result<(), RelayError> {
            let mut written = self.written.lock().unwrap();
            if Some(written.len()) == self.fail_after {
                return Err(RelayError::RelayIo("sink rejected write".to_string()));
            }
            written.push(packet.clone());
            Ok(())
        }
    }

    struct ScriptedFeedback(Mutex<usize>);

    #[async_trait]
    impl FeedbackSource for ScriptedFeedback {
        async fn read_feedback(&self, _scratch: &mut [u8]) -> Result<usize, RelayError> {
            let mut remaining = self.0.lock().unwrap();
            if *remaining == 0 {
                return Err(RelayError::RelayIo("sender torn down".to_string()));
            }
            *remaining -= 1;
            Ok(64)
        }
    }

    struct StalledFeedback;

    #[async_trait]
    impl FeedbackSource for StalledFeedback {
        async fn read_feedback(&self, _scratch: &mut [u8]) -> Result<usize, RelayError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn forwards_packets_in_arrival_order() {
        let source = ScriptedSource::new(vec![
            Ok(packet(1, b"alpha")),
            Ok(packet(2, b"beta")),
            Ok(packet(3, b"gamma")),
        ]);
        let sink = RecordingSink::default();

        let err = relay_rtp(&source, &sink).await;
        assert!(matches!(err, RelayError::RelayIo(_)));

        let written = sink.written.lock().unwrap();
        assert_eq!(written.len(), 3);
        assert_eq!(
            written
                .iter()
                .map(|p| p.header.sequence_number)
                .collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(written[0].payload.as_ref(), b"alpha");
        assert_eq!(written[2].payload.as_ref(), b"gamma");
    }

    #[tokio::test]
    async fn read_failure_ends_the_loop_after_delivered_packets() {
        let source = ScriptedSource::new(vec![
            Ok(packet(7, b"a")),
            Ok(packet(8, b"b")),
            Ok(packet(9, b"c")),
            Err(RelayError::RelayIo("inbound track closed".to_string())),
        ]);
        let sink = RecordingSink::default();

        let err = relay_rtp(&source, &sink).await;
        assert!(err.to_string().contains("inbound track closed"));
        assert_eq!(sink.written.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn write_failure_is_fatal_too() {
        let source = ScriptedSource::new(vec![Ok(packet(1, b"a")), Ok(packet(2, b"b"))]);
        let sink = RecordingSink {
            written: Mutex::new(vec![]),
            fail_after: Some(1),
        };

        let err = relay_rtp(&source, &sink).await;
        assert!(err.to_string().contains("sink rejected write"));
        assert_eq!(sink.written.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drain_stops_silently_when_the_channel_closes() {
        let source = ScriptedFeedback(Mutex::new(5));
        drain_feedback(&source).await;
        assert_eq!(*source.0.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn stalled_feedback_does_not_hold_up_the_relay() {
        let drain = tokio::spawn(async { drain_feedback(&StalledFeedback).await });

        let source = ScriptedSource::new(vec![Ok(packet(1, b"a")), Ok(packet(2, b"b"))]);
        let sink = RecordingSink::default();
        relay_rtp(&source, &sink).await;

        assert_eq!(sink.written.lock().unwrap().len(), 2);
        assert!(!drain.is_finished());
        drain.abort();
    }

    #[tokio::test]
    async fn keyframe_requester_stops_when_the_connection_is_gone() {
        let gone: Weak<RTCPeerConnection> = Weak::new();
        tokio::time::timeout(
            Duration::from_secs(1),
            request_keyframes(gone, 1234, Duration::from_millis(1)),
        )
        .await
        .expect("requester should end once the connection is dropped");
    }
}

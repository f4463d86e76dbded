//! Boundary to the real-time media engine. Negotiation crypto, ICE and
//! SRTP all live inside the `webrtc` crate; this module only consumes
//! its capability set and republishes received RTP onto loopback ports.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::{API, APIBuilder};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Marshal;

use crate::media::types::{RelayPorts, AUDIO_PAYLOAD, RELAY_IP, VIDEO_PAYLOAD};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("no negotiated transport")]
    NotNegotiated,
    #[error("relay socket: {0}")]
    Socket(#[from] std::io::Error),
}

/// Loopback addresses republished RTP is sent to.
#[derive(Clone, Copy, Debug)]
pub struct RelayTarget {
    pub audio: SocketAddr,
    pub video: SocketAddr,
}

impl RelayTarget {
    pub fn loopback(ports: RelayPorts) -> Self {
        Self {
            audio: format!("{}:{}", RELAY_IP, ports.audio).parse().unwrap(),
            video: format!("{}:{}", RELAY_IP, ports.video).parse().unwrap(),
        }
    }
}

/// Media-engine capability set consumed by the relay pipeline.
#[async_trait]
pub trait RtcEngine: Send + Sync {
    /// Negotiates a transport from the peer's offer. Republishing is
    /// deferred until [`RtcTransport::start_forwarding`].
    async fn create_transport(&self, offer_sdp: &str)
        -> Result<Box<dyn RtcTransport>, EngineError>;
}

#[async_trait]
pub trait RtcTransport: Send + Sync {
    /// Local session description produced during negotiation.
    fn answer(&self) -> &str;

    /// Begins republishing negotiated tracks toward the target.
    async fn start_forwarding(&self, target: RelayTarget) -> Result<(), EngineError>;

    /// Stops forwarding and closes the transport. Idempotent.
    async fn close(&self);
}

/// Production engine backed by webrtc-rs peer connections.
pub struct WebRtcEngine;

impl WebRtcEngine {
    pub fn new() -> Self {
        Self
    }
}

fn neg(e: webrtc::Error) -> EngineError {
    EngineError::Negotiation(e.to_string())
}

/// Capabilities are limited to what the transcoder SDP declares: Opus
/// 48k/2ch and constrained-baseline H.264 in packetization-mode 1.
fn build_api() -> Result<API, EngineError> {
    let mut media = MediaEngine::default();
    media
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(neg)?;
    media
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line:
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                            .to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: 102,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(neg)?;

    let registry = register_default_interceptors(Registry::new(), &mut media).map_err(neg)?;
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

#[derive(Clone)]
struct ForwardTarget {
    socket: Arc<UdpSocket>,
    audio: SocketAddr,
    video: SocketAddr,
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    async fn create_transport(
        &self,
        offer_sdp: &str,
    ) -> Result<Box<dyn RtcTransport>, EngineError> {
        let api = build_api()?;
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .map_err(neg)?,
        );

        // Tracks are drained from arrival; packets are only republished
        // once a forward target is set by start_forwarding.
        let (target_tx, target_rx) = watch::channel::<Option<ForwardTarget>>(None);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let target_rx = target_rx.clone();
            Box::pin(async move {
                forward_track(track, target_rx).await;
            })
        }));

        let offer =
            RTCSessionDescription::offer(offer_sdp.to_string()).map_err(neg)?;
        pc.set_remote_description(offer).await.map_err(neg)?;
        let answer = pc.create_answer(None).await.map_err(neg)?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(answer).await.map_err(neg)?;
        let _ = gather_complete.recv().await;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| EngineError::Negotiation("no local description".to_string()))?;

        Ok(Box::new(WebRtcTransport {
            pc,
            answer: local.sdp,
            target_tx,
        }))
    }
}

struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    answer: String,
    target_tx: watch::Sender<Option<ForwardTarget>>,
}

#[async_trait]
impl RtcTransport for WebRtcTransport {
    fn answer(&self) -> &str {
        &self.answer
    }

    async fn start_forwarding(&self, target: RelayTarget) -> Result<(), EngineError> {
        let socket = Arc::new(UdpSocket::bind((RELAY_IP, 0)).await?);
        let _ = self.target_tx.send(Some(ForwardTarget {
            socket,
            audio: target.audio,
            video: target.video,
        }));
        Ok(())
    }

    async fn close(&self) {
        let _ = self.target_tx.send(None);
        let _ = self.pc.close().await;
    }
}

/// Reads RTP from one remote track and republishes it on loopback with
/// the payload type the transcoder SDP declares for that kind.
async fn forward_track(
    track: Arc<TrackRemote>,
    target_rx: watch::Receiver<Option<ForwardTarget>>,
) {
    let kind = track.kind();
    loop {
        let (mut pkt, _attrs) = match track.read_rtp().await {
            Ok(v) => v,
            Err(_) => break,
        };
        let target = match &*target_rx.borrow() {
            Some(t) => t.clone(),
            None => continue,
        };
        let (addr, payload_type) = match kind {
            RTPCodecType::Audio => (target.audio, AUDIO_PAYLOAD),
            _ => (target.video, VIDEO_PAYLOAD),
        };
        pkt.header.payload_type = payload_type;
        let buf = match pkt.marshal() {
            Ok(b) => b,
            Err(e) => {
                log::warn!("Relay: rtp marshal failed: {}", e);
                continue;
            }
        };
        if target.socket.send_to(&buf, addr).await.is_err() {
            break;
        }
    }
    log::debug!("Relay: {} track ended", kind);
}

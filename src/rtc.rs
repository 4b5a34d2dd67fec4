//! WebRTC-backed implementation of the negotiation seam.
//!
//! Everything engine-specific lives here: building the API object,
//! peer connection setup, SDP/candidate type conversions, and the
//! trickle-ICE callbacks. The rest of the crate only sees
//! [`MediaSession`] and browser-shaped protocol types.

use crate::media::LocalMedia;
use crate::negotiation::{MediaSession, MediaSessionFactory, NegotiationError, NegotiationEvent};
use crate::protocol::{CandidateInit, SessionDesc};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

fn engine_err(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Engine(e.to_string())
}

fn to_engine_desc(desc: &SessionDesc) -> Result<RTCSessionDescription, NegotiationError> {
    let mapped = if desc.is_offer() {
        RTCSessionDescription::offer(desc.sdp.clone())
    } else if desc.is_answer() {
        RTCSessionDescription::answer(desc.sdp.clone())
    } else {
        return Err(NegotiationError::Sdp(format!(
            "unsupported description type {:?}",
            desc.kind
        )));
    };
    mapped.map_err(|e| NegotiationError::Sdp(e.to_string()))
}

fn to_engine_candidate(candidate: CandidateInit) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_engine_candidate(init: RTCIceCandidateInit) -> CandidateInit {
    CandidateInit {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

/// Builds one peer connection per call attempt.
pub struct RtcSessionFactory {
    ice_servers: Vec<String>,
}

impl RtcSessionFactory {
    pub fn new() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }

    pub fn with_ice_servers(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn build_api() -> Result<API, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(engine_err)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| NegotiationError::Engine(e.to_string()))?;
        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }
}

impl Default for RtcSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSessionFactory for RtcSessionFactory {
    async fn create_session(
        &self,
        media: &LocalMedia,
        events: mpsc::Sender<NegotiationEvent>,
    ) -> Result<Arc<dyn MediaSession>, NegotiationError> {
        let api = Self::build_api()?;
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(engine_err)?);

        // Tracks must be attached before the first offer/answer so their
        // m-lines are part of it.
        for track in media.tracks() {
            pc.add_track(track.clone()).await.map_err(engine_err)?;
        }

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                // None marks the end of gathering.
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(json) => {
                        let init = from_engine_candidate(json);
                        if tx.send(NegotiationEvent::LocalCandidate(init)).await.is_err() {
                            debug!("Dropping local candidate: negotiation listener is gone");
                        }
                    }
                    Err(e) => warn!("Could not serialize local candidate: {e}"),
                }
            })
        }));

        // Report a failed media path at most once per session.
        let failure_tx = Arc::new(StdMutex::new(Some(events)));
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let failure_tx = failure_tx.clone();
            Box::pin(async move {
                debug!("ICE connection state: {state}");
                if state == RTCIceConnectionState::Failed {
                    let taken = failure_tx.lock().unwrap().take();
                    if let Some(tx) = taken {
                        let _ = tx
                            .send(NegotiationEvent::ConnectionFailed(
                                "ICE connection failed".to_string(),
                            ))
                            .await;
                    }
                }
            })
        }));

        Ok(Arc::new(RtcSession { pc }))
    }
}

struct RtcSession {
    pc: Arc<RTCPeerConnection>,
}

impl RtcSession {
    async fn local_description(&self) -> Result<SessionDesc, NegotiationError> {
        let desc = self.pc.local_description().await.ok_or_else(|| {
            NegotiationError::Engine("local description missing after set".to_string())
        })?;
        Ok(SessionDesc {
            kind: desc.sdp_type.to_string(),
            sdp: desc.sdp,
        })
    }
}

#[async_trait]
impl MediaSession for RtcSession {
    async fn create_offer(&self) -> Result<SessionDesc, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(engine_err)?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(engine_err)?;
        self.local_description().await
    }

    async fn apply_remote_offer(
        &self,
        offer: SessionDesc,
    ) -> Result<SessionDesc, NegotiationError> {
        if !offer.is_offer() {
            return Err(NegotiationError::Sdp(format!(
                "expected an offer, got {:?}",
                offer.kind
            )));
        }
        self.pc
            .set_remote_description(to_engine_desc(&offer)?)
            .await
            .map_err(|e| NegotiationError::Sdp(e.to_string()))?;
        let answer = self.pc.create_answer(None).await.map_err(engine_err)?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(engine_err)?;
        self.local_description().await
    }

    async fn apply_remote_answer(&self, answer: SessionDesc) -> Result<(), NegotiationError> {
        if !answer.is_answer() {
            return Err(NegotiationError::Sdp(format!(
                "expected an answer, got {:?}",
                answer.kind
            )));
        }
        self.pc
            .set_remote_description(to_engine_desc(&answer)?)
            .await
            .map_err(|e| NegotiationError::Sdp(e.to_string()))
    }

    async fn add_remote_candidate(
        &self,
        candidate: CandidateInit,
    ) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(to_engine_candidate(candidate))
            .await
            .map_err(|e| NegotiationError::Candidate(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Error closing peer connection: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

    #[test]
    fn candidate_conversion_keeps_every_field() {
        let init = CandidateInit {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.5 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: Some("frag".to_string()),
        };
        let roundtripped = from_engine_candidate(to_engine_candidate(init.clone()));
        assert_eq!(roundtripped, init);
    }

    #[test]
    fn descriptions_map_by_kind() {
        let offer = to_engine_desc(&SessionDesc::offer(MINIMAL_SDP)).unwrap();
        assert_eq!(offer.sdp_type.to_string(), "offer");
        let answer = to_engine_desc(&SessionDesc::answer(MINIMAL_SDP)).unwrap();
        assert_eq!(answer.sdp_type.to_string(), "answer");
    }

    #[test]
    fn rollback_is_rejected() {
        let desc = SessionDesc {
            kind: "rollback".to_string(),
            sdp: String::new(),
        };
        assert!(matches!(
            to_engine_desc(&desc),
            Err(NegotiationError::Sdp(_))
        ));
    }
}

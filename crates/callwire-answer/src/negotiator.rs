//! Answer-side peer session.
//!
//! A [`PeerSession`] walks one peer connection through
//! `Created -> HaveRemoteOffer -> HaveLocalAnswer -> CandidatesApplied -> Active`
//! and ends in `Closed`. Each step is one-shot; calling a step out of order
//! returns [`Error::InvalidTransition`] and leaves the session untouched.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callwire_common::{Error, IceCandidateRecord, Result, SdpType, SessionDescription};
use callwire_media::VideoTrack;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use crate::lifecycle::CallSession;

/// Upper bound on waiting for local ICE gathering before the answer is
/// read back.
const ICE_GATHER_TIMEOUT: Duration = Duration::from_millis(2500);
const RTCP_BUFFER: usize = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    HaveRemoteOffer,
    HaveLocalAnswer,
    CandidatesApplied,
    Active,
    Closed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Created => "created",
            Phase::HaveRemoteOffer => "have-remote-offer",
            Phase::HaveLocalAnswer => "have-local-answer",
            Phase::CandidatesApplied => "candidates-applied",
            Phase::Active => "active",
            Phase::Closed => "closed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of applying the remote candidate list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateReport {
    pub applied: usize,
    pub rejected: usize,
}

enum State {
    Created {
        pc: Arc<RTCPeerConnection>,
    },
    HaveRemoteOffer {
        pc: Arc<RTCPeerConnection>,
    },
    HaveLocalAnswer {
        pc: Arc<RTCPeerConnection>,
        track: Arc<VideoTrack>,
        answer: SessionDescription,
    },
    CandidatesApplied {
        pc: Arc<RTCPeerConnection>,
        track: Arc<VideoTrack>,
        answer: SessionDescription,
    },
    Active {
        pc: Arc<RTCPeerConnection>,
        track: Arc<VideoTrack>,
    },
    Closed,
}

impl State {
    fn phase(&self) -> Phase {
        match self {
            State::Created { .. } => Phase::Created,
            State::HaveRemoteOffer { .. } => Phase::HaveRemoteOffer,
            State::HaveLocalAnswer { .. } => Phase::HaveLocalAnswer,
            State::CandidatesApplied { .. } => Phase::CandidatesApplied,
            State::Active { .. } => Phase::Active,
            State::Closed => Phase::Closed,
        }
    }
}

/// One peer connection answering one call.
pub struct PeerSession {
    state: State,
}

impl PeerSession {
    /// Build a fresh peer connection using the given STUN/TURN URLs.
    pub async fn new(ice_servers: &[String]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::answer_failed(format!("failed to register codecs: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| Error::answer_failed(format!("failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| Error::answer_failed(format!("failed to create peer connection: {e}")))?;

        pc.on_peer_connection_state_change(Box::new(|s: RTCPeerConnectionState| {
            match s {
                RTCPeerConnectionState::Failed => warn!("peer connection failed"),
                other => info!("peer connection state: {}", other),
            }
            Box::pin(async {})
        }));

        debug!("peer session created with {} ICE server(s)", ice_servers.len());
        Ok(Self {
            state: State::Created { pc: Arc::new(pc) },
        })
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    fn out_of_order(&self, attempted: &'static str) -> Error {
        Error::InvalidTransition {
            state: self.phase().as_str(),
            attempted,
        }
    }

    /// `Created -> HaveRemoteOffer`.
    pub async fn accept_offer(&mut self, offer: &SessionDescription) -> Result<()> {
        let State::Created { pc } = &self.state else {
            return Err(self.out_of_order("accept an offer"));
        };
        if offer.sdp_type != SdpType::Offer {
            return Err(Error::invalid_remote(format!(
                "expected an offer, got {}",
                offer.sdp_type.as_str()
            )));
        }

        let description =
            RTCSessionDescription::offer(offer.sdp.clone()).map_err(Error::invalid_remote)?;
        pc.set_remote_description(description)
            .await
            .map_err(Error::invalid_remote)?;

        info!("remote offer accepted");
        self.state = State::HaveRemoteOffer { pc: Arc::clone(pc) };
        Ok(())
    }

    /// `HaveRemoteOffer -> HaveLocalAnswer`.
    ///
    /// The track is attached before the answer is generated so the answer
    /// carries a send direction for it. A track already attached elsewhere
    /// is refused without touching the session. Any later failure releases
    /// the track and closes the session, since the connection may already
    /// carry the sender.
    pub async fn create_answer(&mut self, track: Arc<VideoTrack>) -> Result<()> {
        let State::HaveRemoteOffer { pc } = &self.state else {
            return Err(self.out_of_order("create an answer"));
        };
        let pc = Arc::clone(pc);
        let local = track.attach().map_err(Error::answer_failed)?;

        let answer = match answer_with_track(&pc, local).await {
            Ok(answer) => answer,
            Err(e) => {
                track.release();
                self.state = State::Closed;
                if let Err(close_err) = pc.close().await {
                    warn!("error closing peer connection: {}", close_err);
                }
                warn!("answer failed, peer session closed: {}", e);
                return Err(e);
            }
        };

        info!(
            "local answer committed ({} bytes SDP, {:?})",
            answer.sdp.len(),
            track.codec()
        );
        self.state = State::HaveLocalAnswer { pc, track, answer };
        Ok(())
    }

    /// `HaveLocalAnswer -> CandidatesApplied`.
    ///
    /// Candidates are applied in order. One the engine refuses is logged and
    /// counted, never fatal here.
    pub async fn apply_candidates(
        &mut self,
        candidates: &[IceCandidateRecord],
    ) -> Result<CandidateReport> {
        let State::HaveLocalAnswer { pc, track, answer } = &self.state else {
            return Err(self.out_of_order("apply candidates"));
        };

        let mut report = CandidateReport::default();
        for candidate in candidates {
            match add_candidate(pc, candidate).await {
                Ok(()) => {
                    debug!("applied {}", candidate);
                    report.applied += 1;
                }
                Err(e) => {
                    warn!("{}", e);
                    report.rejected += 1;
                }
            }
        }
        info!(
            "remote candidates: {} applied, {} rejected",
            report.applied, report.rejected
        );

        self.state = State::CandidatesApplied {
            pc: Arc::clone(pc),
            track: Arc::clone(track),
            answer: answer.clone(),
        };
        Ok(report)
    }

    /// `CandidatesApplied -> Active`. Starts the media feed and hands back
    /// the answer to publish.
    pub async fn activate(&mut self) -> Result<SessionDescription> {
        let State::CandidatesApplied { pc, track, answer } = &self.state else {
            return Err(self.out_of_order("activate"));
        };
        track.start()?;

        let answer = answer.clone();
        self.state = State::Active {
            pc: Arc::clone(pc),
            track: Arc::clone(track),
        };
        info!("peer session active");
        Ok(answer)
    }

    /// Release the connection and the track. A no-op once closed.
    pub async fn close(&mut self) {
        let (pc, track) = match std::mem::replace(&mut self.state, State::Closed) {
            State::Closed => {
                debug!("peer session already closed");
                return;
            }
            State::Created { pc } | State::HaveRemoteOffer { pc } => (pc, None),
            State::HaveLocalAnswer { pc, track, .. }
            | State::CandidatesApplied { pc, track, .. }
            | State::Active { pc, track } => (pc, Some(track)),
        };

        if let Some(track) = track {
            track.release();
        }
        if let Err(e) = pc.close().await {
            warn!("error closing peer connection: {}", e);
        }
        info!("peer session closed");
    }
}

#[async_trait]
impl CallSession for PeerSession {
    async fn close(&mut self) {
        PeerSession::close(self).await;
    }
}

async fn answer_with_track(
    pc: &RTCPeerConnection,
    local: Arc<dyn TrackLocal + Send + Sync>,
) -> Result<SessionDescription> {
    let sender = pc
        .add_track(local)
        .await
        .map_err(|e| Error::answer_failed(format!("failed to add video track: {e}")))?;

    // Incoming RTCP has to be read for the interceptors to run.
    tokio::spawn(async move {
        let mut buf = vec![0u8; RTCP_BUFFER];
        while sender.read(&mut buf).await.is_ok() {}
    });

    let answer = pc.create_answer(None).await.map_err(Error::answer_failed)?;
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer)
        .await
        .map_err(|e| Error::answer_failed(format!("failed to set local description: {e}")))?;

    if tokio::time::timeout(ICE_GATHER_TIMEOUT, gather_complete.recv())
        .await
        .is_err()
    {
        debug!("ICE gathering still running after {:?}", ICE_GATHER_TIMEOUT);
    }

    let committed = pc
        .local_description()
        .await
        .ok_or_else(|| Error::answer_failed("no local description after commit"))?;
    Ok(SessionDescription::answer(committed.sdp))
}

async fn add_candidate(pc: &RTCPeerConnection, candidate: &IceCandidateRecord) -> Result<()> {
    let init = RTCIceCandidateInit {
        candidate: candidate.to_candidate_line(),
        sdp_mid: Some(candidate.sdp_mid.clone()),
        sdp_mline_index: None,
        username_fragment: None,
    };
    pc.add_ice_candidate(init)
        .await
        .map_err(|e| Error::candidate_rejected(format!("{candidate}: {e}")))
}

//! Signaling records exchanged through the call document.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Prefix carried by the first token of every candidate line.
pub const CANDIDATE_PREFIX: &str = "candidate:";

/// Number of positional tokens a candidate line must carry.
const CANDIDATE_TOKENS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

impl FromStr for SdpType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "offer" => Ok(SdpType::Offer),
            "answer" => Ok(SdpType::Answer),
            other => Err(Error::invalid_remote(format!(
                "unsupported description type {other:?}"
            ))),
        }
    }
}

/// An SDP blob together with its role in the exchange.
///
/// Mirrors the `{sdp, type}` maps stored under `offer` and `answer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Offer,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Answer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateProtocol {
    Udp,
    Tcp,
}

impl CandidateProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            CandidateProtocol::Udp => "udp",
            CandidateProtocol::Tcp => "tcp",
        }
    }
}

impl FromStr for CandidateProtocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(CandidateProtocol::Udp),
            "TCP" => Ok(CandidateProtocol::Tcp),
            _ => Err(format!("unknown protocol {s:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

impl CandidateType {
    pub fn as_str(self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::Srflx => "srflx",
            CandidateType::Prflx => "prflx",
            CandidateType::Relay => "relay",
        }
    }
}

impl FromStr for CandidateType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::Srflx),
            "prflx" => Ok(CandidateType::Prflx),
            "relay" => Ok(CandidateType::Relay),
            _ => Err(format!("unknown candidate type {s:?}")),
        }
    }
}

/// A remote ICE candidate parsed from its wire text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateRecord {
    pub foundation: String,
    pub component: u16,
    pub protocol: CandidateProtocol,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub candidate_type: CandidateType,
    /// The `sdpMid` of the media line this candidate was gathered for.
    pub sdp_mid: String,
}

impl IceCandidateRecord {
    /// Parse `candidate:<foundation> <component> <protocol> <priority> <ip> <port> typ <type>`.
    ///
    /// Tokens past the eighth (`raddr`, `generation`, `ufrag`, ...) are ignored.
    pub fn parse(text: &str, sdp_mid: &str) -> Result<Self> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.len() < CANDIDATE_TOKENS {
            return Err(Error::malformed_candidate(
                text,
                format!("expected {CANDIDATE_TOKENS} tokens, got {}", tokens.len()),
            ));
        }

        let foundation = tokens[0]
            .strip_prefix(CANDIDATE_PREFIX)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| Error::malformed_candidate(text, "missing candidate:<foundation>"))?;

        let component: u16 = tokens[1]
            .parse()
            .map_err(|_| Error::malformed_candidate(text, "component is not numeric"))?;
        if !(1..=2).contains(&component) {
            return Err(Error::malformed_candidate(
                text,
                format!("component {component} out of range"),
            ));
        }

        let protocol = tokens[2]
            .parse::<CandidateProtocol>()
            .map_err(|e| Error::malformed_candidate(text, e))?;
        let priority: u32 = tokens[3]
            .parse()
            .map_err(|_| Error::malformed_candidate(text, "priority is not numeric"))?;
        let port: u16 = tokens[5]
            .parse()
            .map_err(|_| Error::malformed_candidate(text, "port is not a 16-bit number"))?;

        if tokens[6] != "typ" {
            return Err(Error::malformed_candidate(text, "expected `typ` at token 6"));
        }
        let candidate_type = tokens[7]
            .parse::<CandidateType>()
            .map_err(|e| Error::malformed_candidate(text, e))?;

        Ok(Self {
            foundation: foundation.to_string(),
            component,
            protocol,
            priority,
            ip: tokens[4].to_string(),
            port,
            candidate_type,
            sdp_mid: sdp_mid.to_string(),
        })
    }

    /// Canonical wire text for this candidate.
    pub fn to_candidate_line(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for IceCandidateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{CANDIDATE_PREFIX}{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol.as_str(),
            self.priority,
            self.ip,
            self.port,
            self.candidate_type.as_str()
        )
    }
}

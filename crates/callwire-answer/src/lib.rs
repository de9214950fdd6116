//! Answering side of a callwire video call.
//!
//! [`answer_call`] fetches the offer, negotiates a [`PeerSession`], publishes
//! the answer and holds the call until hangup, local interrupt or timeout.

#![forbid(unsafe_code)]

pub mod answer;
pub mod lifecycle;
pub mod negotiator;

pub use answer::{answer_call, AnswerConfig, DEFAULT_STUN_SERVERS};
pub use lifecycle::{
    supervise, CallGate, CallOutcome, CallSession, GateTrigger, TeardownReason, DEFAULT_MAX_CALL,
};
pub use negotiator::{CandidateReport, PeerSession, Phase};

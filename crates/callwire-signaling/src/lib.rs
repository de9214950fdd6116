//! Signaling store access for callwire.
//!
//! The call document layout is fixed by the caller side:
//! - `calls/{id}`: `offer`, `answer` (`{sdp, type}` maps) and `hangup`
//! - `calls/{id}/offerCandidates/*`: `{candidate, sdpMid}`
//!
//! [`SignalingClient`] speaks that layout on top of any [`DocumentStore`];
//! [`FirestoreStore`] is the production backend and [`MemoryStore`] the
//! in-process one.

#![forbid(unsafe_code)]

pub mod client;
pub mod credentials;
pub mod firestore;
pub mod memory;
pub mod store;
pub mod value;

pub use client::{HangupSubscription, SignalingClient, CALLS_COLLECTION, OFFER_CANDIDATES};
pub use credentials::{ServiceAccountKey, TokenSource};
pub use firestore::FirestoreStore;
pub use memory::MemoryStore;
pub use store::{Document, DocumentChange, DocumentStore, DocumentWatch};
pub use value::{Fields, Value};

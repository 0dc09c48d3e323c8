//! Core of a Messaging Layer Security (MLS) group keying engine.
//!
//! Given a group of N members, the engine maintains a continuously evolving
//! sequence of shared secrets such that every current member agrees on the
//! same secrets for each epoch, new members cannot read earlier epochs, and
//! compromise of a member's keys stops mattering once that member has
//! updated or been removed.
//!
//! Three subsystems make up the core:
//!
//! - [`treekem`] — the left-balanced binary ratchet tree that lets any
//!   member inject fresh entropy along its direct path;
//! - [`key_schedule`] — the HKDF chain that turns each commit secret into
//!   the family of epoch secrets and per-sender hash ratchets;
//! - [`group_state`] — the proposal/commit state machine and the message
//!   protection layer built on the ratchets.
//!
//! Cryptographic primitives are selected at runtime by a [`CipherSuite`]
//! value; serialization is the deterministic length-prefixed encoding in
//! [`syntax`].  The engine does no I/O and keeps no global state.

pub mod common;
pub mod crypto;
pub mod group_state;
pub mod io;
pub mod key_schedule;
pub mod protocol;
pub mod syntax;
pub mod transcript_hash;
pub mod tree_math;
pub mod treekem;

pub use common::{Error, Result};
pub use crypto::{CipherSuite, Secret};
pub use group_state::State;
pub use key_schedule::KeyScheduleEpoch;
pub use protocol::{
    Content, Credential, KeyPackage, KeyPackageBundle, MlsCiphertext, MlsPlaintext, Proposal,
    Welcome,
};
pub use tree_math::LeafIndex;

use thiserror::Error;

/// Errors surfaced by the group keying engine.
///
/// Every fallible operation is total: it either succeeds with a value or
/// returns one of these kinds together with a human-readable reason.  No
/// partial state mutation is observable after a failing call.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller misuse: wrong epoch or group, out-of-range index, a self-commit
    /// fed to the peer-handle path, and the like.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Wire input that parsed but violates a protocol invariant: bad
    /// signature or MAC, AEAD failure, unknown proposal reference, parent
    /// hash mismatch, expired ratchet key, confirmation mismatch.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// The cipher suite code point is known but not implemented here.
    #[error("unsupported cipher suite: {0:#06x}")]
    UnsupportedCipherSuite(u16),

    /// Optional protocol features outside the core (PSKs, external init,
    /// reinit, X.509 credential evaluation).
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

pub type Result<T> = core::result::Result<T, Error>;

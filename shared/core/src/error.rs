use thiserror::Error;

/// Shared error type for the distributed distance engine and the cadence
/// controller. Every leaf crate (`psyche-core`, `psyche-comm`,
/// `psyche-modeling`, `psyche-cadence`) returns this from its fallible
/// entry points; orchestration code wraps it in `anyhow::Result`.
#[derive(Debug, Error)]
pub enum Error {
    /// A mistake the caller made, detected before any communication or
    /// computation happens. Never the result of a straggler or a transport
    /// hiccup.
    #[error("{0}")]
    Caller(String),

    /// The message-passing transport failed. Fatal: there is no retry path,
    /// per the failure model (stragglers are tolerated, losses are not).
    #[error("transport error: {0}")]
    Transport(String),

    /// An invariant the implementation itself is supposed to maintain was
    /// violated (e.g. more than one queued send record for a subgroup).
    /// This means there's a bug in this crate, not in the caller's usage.
    #[error("internal invariant violated: {0}")]
    InternalInvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error Types Module
///
/// This module defines the error taxonomy for the probe. The split matters
/// for the propagation policy: only `InputParse` and `Bootstrap` abort a
/// check; every other failure is operational and is embedded in the report
/// fields so callers always receive a complete diagnostic picture.
use thiserror::Error;

/// Errors produced by the diagnostic engine.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Malformed CID or multiaddress supplied by the caller.
    #[error("invalid input: {0}")]
    InputParse(String),

    /// Host or DHT construction failed. Fatal for the invocation.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// No DHT server answered a peer-address lookup.
    #[error("could not find the peer in the DHT: no DHT server responded")]
    DhtUnavailable,

    /// Dial failed on every address, or the dial deadline expired.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// Stream negotiation failed after a connection was established.
    #[error("protocol negotiation failed: {0}")]
    Negotiation(String),

    /// The block-exchange query itself errored.
    #[error("block exchange query failed: {0}")]
    BlockProbe(String),

    /// The host actor is gone. Treated as a bootstrap-class failure.
    #[error("host event loop has shut down")]
    HostClosed,
}

impl ProbeError {
    /// Whether this error aborts the whole check instead of landing in a
    /// report field.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProbeError::InputParse(_) | ProbeError::Bootstrap(_) | ProbeError::HostClosed
        )
    }
}

/// Result type alias for probe operations
pub type ProbeResult<T> = Result<T, ProbeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(ProbeError::InputParse("bad cid".into()).is_fatal());
        assert!(ProbeError::Bootstrap("no keypair".into()).is_fatal());
        assert!(!ProbeError::Unreachable("all dials failed".into()).is_fatal());
        assert!(!ProbeError::DhtUnavailable.is_fatal());
        assert!(!ProbeError::BlockProbe("timed out".into()).is_fatal());
    }

    #[test]
    fn display_includes_cause() {
        let err = ProbeError::Unreachable("dial 203.0.113.7 refused".into());
        assert!(err.to_string().contains("203.0.113.7"));
    }
}

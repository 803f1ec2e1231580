//! Unified error kinds for the worker node.
//!
//! One enum, kind-oriented rather than source-oriented: the work loop decides
//! retry semantics from the kind alone, so collaborators map their failures
//! into these variants at the boundary and nothing re-wraps downstream.

use thiserror::Error;

/// Errors surfaced by node components.
///
/// Transient kinds (`RpcTransient`, `BlobTransient`, `ContainerUnreachable`)
/// are dropped to a log line by the work loop and retried on the next tick.
/// `BlobAuth` and `Misconfiguration` surface through the health monitor.
#[derive(Debug, Error)]
pub enum NodeError {
    /// RPC endpoint failed in a way that may heal on its own.
    #[error("transient rpc failure: {0}")]
    RpcTransient(String),

    /// RPC endpoint rejected the request; retrying will not help.
    #[error("permanent rpc failure: {0}")]
    RpcPermanent(String),

    /// On-chain account or document bytes did not decode.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Blob gateway failed in a way that may heal on its own.
    #[error("transient blob gateway failure: {0}")]
    BlobTransient(String),

    /// Blob gateway credential is absent or was rejected.
    #[error("blob gateway credential missing or rejected")]
    BlobAuth,

    /// Container engine did not respond.
    #[error("container engine unreachable: {0}")]
    ContainerUnreachable(String),

    /// A flow operation failed; recorded in the flow's results.
    #[error("operation '{op}' failed: {reason}")]
    OpFailed { op: String, reason: String },

    /// The run outlived its market timeout.
    #[error("run expired")]
    ExpiredRun,

    /// Durable store failure (read, write, or corrupt record).
    #[error("storage failure: {0}")]
    Storage(String),

    /// Invalid configuration. Fatal at startup, a health reason afterwards.
    #[error("misconfiguration: {0}")]
    Misconfiguration(String),

    /// Shutdown was requested while the operation was in flight.
    #[error("cancelled")]
    Cancelled,
}

impl NodeError {
    /// Whether the work loop should retry on the next tick instead of
    /// changing state.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::RpcTransient(_)
                | NodeError::BlobTransient(_)
                | NodeError::ContainerUnreachable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(NodeError::RpcTransient("conn reset".into()).is_transient());
        assert!(NodeError::BlobTransient("timeout".into()).is_transient());
        assert!(NodeError::ContainerUnreachable("no socket".into()).is_transient());

        assert!(!NodeError::RpcPermanent("bad ix".into()).is_transient());
        assert!(!NodeError::BlobAuth.is_transient());
        assert!(!NodeError::Misconfiguration("no market".into()).is_transient());
        assert!(!NodeError::Cancelled.is_transient());
    }

    #[test]
    fn display_carries_context() {
        let e = NodeError::OpFailed { op: "docker-cmds".into(), reason: "exit 1".into() };
        let msg = e.to_string();
        assert!(msg.contains("docker-cmds"));
        assert!(msg.contains("exit 1"));
    }
}

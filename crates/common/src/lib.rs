//! # Nosana Common Crate
//!
//! Shared leaf types for the Nosana worker node. Nothing in here talks to the
//! network or the filesystem; the node crate composes these into the work
//! loop.
//!
//! ## Modules
//! - `cid`: content addressing (SHA-256 digest ↔ Base58 CID)
//! - `error`: unified error kinds used across the node
//! - `job`: job and result document wire schemas
//! - `flow`: the local executable flow model

pub mod cid;
pub mod error;
pub mod flow;
pub mod job;

pub use cid::{cid_to_digest, digest_to_cid, sha256_digest, sha256_hex};
pub use error::{NodeError, Result};
pub use flow::{Flow, FlowId, OpKind, OpResult, OpStatus, Operation, RESULT_IPFS_KEY};
pub use job::{JobDocument, PipelineSpec, ResultDocument};

//! # Nosana Worker Node
//!
//! A worker node for the Nosana compute market. The node advertises itself
//! in an on-chain market queue, claims assigned runs, materializes each
//! job's content-addressed document into a local flow, executes the flow in
//! a container engine, uploads the result document, and settles the run
//! back on chain with `finish` (or `quit` when the run expires).
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Work Loop                              │
//! │  health gate ─► find assigned run ─► claim ─► run flow ─► settle │
//! └───────┬──────────────┬───────────────┬───────────┬──────────┬───┘
//!         │              │               │           │          │
//!         ▼              ▼               ▼           ▼          ▼
//!   HealthMonitor   MarketClient    FlowBuilder  FlowRunner  Settlement
//!         │              │               │           │          │
//!         ▼              ▼               ▼           ▼          ▼
//!    ChainRpc ◄──────────┘         BlobClient   Container    FlowStore
//!                                               Engine+Git
//! ```
//!
//! External collaborators — chain gateway, container engine, git, blob
//! gateway, key/value store — are traits with shipped mock implementations,
//! so every state transition is testable without a network.
//!
//! ## Key invariants
//!
//! 1. At most one flow is active (claimed but not settled) at any time.
//! 2. An accepted run is never abandoned without an on-chain settlement.
//! 3. A job address maps to at most one flow id, forever.
//! 4. Flow results grow monotonically and are durable before the loop
//!    observes the next transition.
//! 5. `finish` is submitted only after the result CID is durably uploaded.

pub mod blob;
pub mod builder;
pub mod chain;
pub mod config;
pub mod engine;
pub mod git;
pub mod health;
pub mod http;
pub mod market;
pub mod runner;
pub mod settle;
pub mod shutdown;
pub mod store;
pub mod work_loop;

pub use blob::{BlobClient, BlobGateway, HttpBlobGateway, MockBlobGateway};
pub use builder::{BuilderRegistry, FlowBuilder, FlowInputs, PipelineBuilder};
pub use chain::{ChainRpc, InstructionKind, Job, Market, MockChainRpc, Run, TxStatus};
pub use config::{Network, NodeConfig, Signer};
pub use engine::{ContainerEngine, DockerCliEngine, MockEngine, RunSpec};
pub use git::{CliGitClient, GitClient, MockGitClient};
pub use health::{HealthMonitor, HealthReason, HealthReport, Snapshot};
pub use market::{MarketClient, TxOutcome};
pub use runner::FlowRunner;
pub use settle::Settlement;
pub use shutdown::ShutdownCoordinator;
pub use store::{FileKvStore, FlowStore, KvStore, MemoryKvStore};
pub use work_loop::{NodeContext, NodeState, WorkLoop};

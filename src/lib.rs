//! Hemmer ARM Reconcile
//!
//! The reconciliation core shared by every resource of an Azure Resource
//! Manager provider. Resource types only describe how their typed model maps to
//! API payloads; this crate handles everything around that mapping.
//!
//! # Overview
//!
//! - **Resource ids**: [`ResourceId`] parses, builds, and round-trips
//!   hierarchical ARM ids, treating casing as insignificant
//! - **Long-running operations**: [`Poller`] waits for `202 Accepted`
//!   operations with backoff, `Retry-After`, and cancellation
//! - **State waits**: [`StateWaiter`] refreshes a resource until it reports a
//!   target state
//! - **Reconciliation**: [`Engine`] runs Create/Read/Update/Delete/Import with
//!   the import guard, read-after-write, idempotent deletes, and the
//!   conflicting-operation guard
//! - **Drift**: [`drift::detect_drift`] compares desired and observed state
//!   with case-insensitive, unordered, and ignored paths
//! - **Host surface**: [`ProviderRegistry`] dispatches JSON state documents to
//!   the engine for each resource type
//! - **Errors**: structured per-operation errors mapping onto [`tonic::Status`]
//! - **Logging**: [`init_logging`] installs a `tracing` subscriber on stderr
//!
//! # Quick Start
//!
//! ```ignore
//! use hemmer_arm_reconcile::{
//!     Engine, EngineConfig, ManagedResource, OperationContext, ProviderRegistry,
//! };
//! use std::sync::Arc;
//!
//! let config = EngineConfig::from_json(serde_json::json!({
//!     "subscription_id": "00000000-0000-0000-0000-000000000000"
//! }))?;
//! let client: Arc<dyn ArmClient> = Arc::new(MySdkClient::new());
//!
//! let registry = ProviderRegistry::new()
//!     .with_handler(Engine::new(client.clone(), VaultCodec, config.clone()))
//!     .with_handler(Engine::new(client, BatchPoolCodec, config));
//!
//! let ctx = OperationContext::new();
//! let state = registry.create(&ctx, "hemmer_key_vault", planned_state).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod drift;
pub mod engine;
pub mod error;
pub mod host;
pub mod logging;
pub mod lro;
pub mod resource_id;
pub mod testing;
pub mod wait;

// Re-export main types at crate root
pub use client::{ApiResponse, ArmClient};
pub use codec::{Activity, ResourceCodec, ShapeGeneration};
pub use config::{EngineConfig, Features, Timeouts};
pub use context::{Interrupted, OperationContext};
pub use drift::{AttributeChange, DriftRules, PlanResult};
pub use engine::{Engine, ManagedResource, ReadOutcome, ResourcePhase, UpdateOptions};
pub use error::{
    ApiError, CodecError, ConfigError, CreateError, CreateErrorKind, DeleteError,
    DeleteErrorKind, ParseError, PollError, ReadError, ReadErrorKind, ReconcileError,
    UpdateError, UpdateErrorKind,
};
pub use host::{ProviderRegistry, ResourceHandler};
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use lro::{
    BackoffPolicy, OperationHandle, OperationKind, OperationSource, OperationStatus,
    PendingOperation, Poller, PollerOptions, TerminalResult,
};
pub use resource_id::{ResourceId, Segment};
pub use wait::StateWaiter;

// Re-export async_trait for convenience
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tokio_util::sync::CancellationToken;
pub use tonic;
pub use tracing;

//! Strata Engine
//!
//! The provisioning engine: executes a validated dependency graph against
//! a resource driver, converging actual state toward declared state.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ProvisioningEngine                        │
//! │  - wave scheduling over ready nodes (bounded concurrency)   │
//! │  - input resolution at provisioning time                    │
//! │  - diff vs prior state: create / update / replace / no-op   │
//! │  - fail-fast halt, cooperative cancellation                 │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                  │
//!          ▼                                  ▼
//! ┌──────────────────────┐      ┌─────────────────────────────┐
//! │   ResourceProvider   │      │    CustomResourceRunner     │
//! │  create/update/delete│      │  invoke with idempotency    │
//! │  (external drivers)  │      │  token, timeout, reconcile  │
//! └──────────────────────┘      └─────────────────────────────┘
//! ```
//!
//! Provisioning failures halt forward progress but never roll back nodes
//! that already reached Ready; re-applying converges the remainder.

mod engine;
mod error;
mod events;
mod external;
mod plan;
mod provider;

pub use engine::{
  AppliedAction, ApplyContext, ApplyOutcome, ApplyReport, EngineOptions, ProvisioningEngine,
  TeardownReport,
};
pub use error::EngineError;
pub use events::{ApplyEvent, ApplyNotifier, ChannelNotifier, NoopNotifier};
pub use external::{
  CustomResourceRunner, EncodedKeyFunction, ExternalError, ExternalFunction, Invocation,
  InvocationError,
};
pub use plan::{PlannedAction, PlannedChange, PriorRecord, PriorState, plan};
pub use provider::{Outputs, ProviderError, ResolvedInputs, ResourceProvider};

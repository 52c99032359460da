//! # parley-engine
//!
//! The orchestration engine.
//!
//! - [`CorrelationRegistry`]: remote ids → `(operation, agent)` pairs
//! - [`TaskExecutor`]: one task against one agent, through clarification
//!   rounds and deferred completion
//! - [`Orchestrator`]: the same task (or any operation) against many agents
//! - [`pagination`]: cursor walking
//! - [`resolver`], [`observer`], [`pending`]: the executor's pluggable seams

#![deny(unsafe_code)]

pub mod correlation;
pub mod error;
pub mod executor;
pub mod observer;
pub mod orchestrator;
pub mod pagination;
pub mod pending;
pub mod resolver;

pub use correlation::{CorrelationIds, CorrelationKey, CorrelationRegistry};
pub use error::StoreError;
pub use executor::{CleanupPolicy, ExecutorConfig, RunOptions, TaskExecutor, TaskRequest};
pub use observer::{CompositeObserver, MetricsObserver, TaskEvent, TaskObserver, TracingObserver};
pub use orchestrator::Orchestrator;
pub use pagination::{Page, PageRequest, PaginationOptions};
pub use pending::{InMemoryPendingStore, PendingOperation, PendingStore, SqlitePendingStore};
pub use resolver::{InputContext, InputDecision, InputResolver, ResolverSpec};

//! # Task Lifecycle
//!
//! Everything that tracks a conversion from upload to eviction.
//!
//! ## Key Components:
//! - **record**: the task state sum type and its persisted shape
//! - **store**: the shared, durable id → record mapping
//! - **dispatcher**: creates tasks and answers status/download lookups
//! - **supervisor**: owns background jobs and the shutdown sequence
//! - **sweeper**: periodic eviction of expired files and records

pub mod dispatcher;
pub mod record;
pub mod store;
pub mod supervisor;
pub mod sweeper;

pub use dispatcher::{DispatchSettings, Dispatcher, TaskLookup};
pub use record::TaskRecord;
pub use store::{JsonTaskStore, TaskStore};
pub use supervisor::Supervisor;
pub use sweeper::RetentionSweeper;

//! Core domain types for the stager replica cache.
//!
//! This crate defines the data model shared by the metadata store and the
//! operator tooling:
//! - Task lifecycle and callback details
//! - Cache replica lifecycle and its state machine
//! - Stage request status and pin expiry policy
//! - Configuration

pub mod config;
pub mod error;
pub mod replica;
pub mod stage_request;
pub mod task;

pub use error::{Error, Result};
pub use replica::{DEFAULT_REPLICA_TYPE, ReplicaId, ReplicaOrigin, ReplicaStatus};
pub use stage_request::{DEFAULT_PIN_WINDOW_SECS, PinExpiryPolicy, StageStatus};
pub use task::{TaskCallback, TaskId, TaskStatus};

//! agent-ensurer library
//!
//! Keeps a floor of alive idle build agents on a CI server. Each cycle it
//! reads agent and cloud-instance state over the server's REST API, works
//! out how many agents are missing, and asks the server to start that many
//! cloud instances.
//!
//! ## Modules
//!
//! - `config`: Flags, environment fallbacks and token indirection
//! - `client`: REST client behind the `ServerApi` trait
//! - `reconciler`: The polling loop
//! - `error`: Error taxonomy
//!
//! The liveness and deficit policy lives in the `ensurer-reconcile` crate.

pub mod client;
pub mod config;
pub mod error;
pub mod reconciler;

// Re-export commonly used types
pub use client::{InstanceHandle, ServerApi, ServerClient};
pub use config::{Cli, Config, CycleErrorPolicy, LogFormat};
pub use error::{ConfigError, EnsurerError, RemoteError};
pub use reconciler::{CycleOutcome, Reconciler, ReconcilerConfig};

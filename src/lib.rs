//! levalideur - Constraint Validation Job Server
//!
//! *Le Valideur* (The Validator) - runs an external validation engine once per
//! submitted constraint document and streams its progress, exit status and report
//! files back to the client as JSON messages.

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

/// Job and API error types
pub mod error;

/// Configuration from TOML and environment
pub mod config;

/// Outbound message model and status codes
pub mod protocol;

/// Per-job working directories and artifact reads
pub mod store;

/// Engine process launching and cancellation
pub mod process;

/// Output multiplexing and status classification
pub mod multiplexer;

/// Job identity and the job lifecycle
pub mod job;

/// Per-connection job coordination
pub mod session;

/// WebSocket transport
#[cfg(feature = "server")]
pub mod websocket;

/// HTTP routes and shared state
#[cfg(feature = "server")]
pub mod handlers;

/// Server instance management
#[cfg(feature = "server")]
pub mod server;

/// Command-line interface
#[cfg(feature = "cli")]
pub mod cli;

pub use config::Config;
pub use error::{JobError, JobResult};
pub use job::{run_job, JobEnvironment, JobId, JobReport};
pub use multiplexer::{Completion, RunSummary, StatusPolicy};
pub use process::{CancelHandle, CancelReason, ProcessRunner, SystemProcessRunner};
pub use protocol::{ProtocolMessage, StatusCode, TerminalStatus};
pub use session::{BusyPolicy, Session, Submission};

#[cfg(feature = "server")]
pub use error::{ApiError, ApiResult};
#[cfg(feature = "server")]
pub use server::ValidationServer;

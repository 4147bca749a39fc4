//! Answer Daemon
//!
//! HTTP surface and command line for the streaming answer pipeline. The
//! pipeline itself lives in `answer-core`; this crate only routes requests
//! to it, exposes the stop and health endpoints, and manages the process.

pub mod cli;
pub mod error;
pub mod server;

pub use cli::{Cli, Command};
pub use error::ApiError;
pub use server::{router, serve, AppState, REQUEST_ID_HEADER};

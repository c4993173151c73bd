//! Ralph - an autonomous agent loop controller
//!
//! Ralph repeatedly invokes an external coding agent, reads the structured
//! status block it emits, and decides after every iteration whether to go on.
//! Persistent state lives in a single JSON document so that a circuit
//! breaker, exit detector and hourly rate limiter survive restarts.

pub mod agent;
pub mod breaker;
pub mod config;
pub mod error;
pub mod exit;
pub mod history;
pub mod id;
pub mod monitor;
pub mod operator;
pub mod rate_limit;
pub mod runner;
pub mod state;
pub mod status;

pub use error::{RalphError, Result};

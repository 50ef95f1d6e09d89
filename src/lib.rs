//! Headless log aggregation and alerting engine for Windows event logs.
//!
//! Polls remote hosts over WinRM, normalizes their event XML into
//! [`model::LogEntry`] rows, stores them in an embedded columnar store, and
//! evaluates alert rules against the arriving stream.

pub mod collector;
pub mod config;
pub mod credentials;
pub mod error;
pub mod model;
pub mod notify;
pub mod parser;
pub mod pool;
pub mod retry;
pub mod rules;
pub mod store;
pub mod transport;

pub use error::{Result, SentinelError};

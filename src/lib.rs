//! sandbox-runner library
//!
//! Runs untrusted Go and JavaScript snippets behind a message queue:
//! - Sandbox runtime: one workspace, one OS identity, one execution at a time
//! - Queue worker that settles every delivery by outcome
//! - RPC client that pairs responses to requests by correlation id

pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod language;
pub mod mq;
pub mod runtime;
pub mod worker;

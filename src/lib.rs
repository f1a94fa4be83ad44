#![warn(missing_docs)]
//! Steamwatch is a distributed Steam Market monitoring backend. It runs one
//! control loop per user-defined monitoring task, publishes check requests
//! onto a durable message bus, drives stateless parsing workers through a
//! rotating proxy pool, and notifies task owners when a matching listing is
//! first observed.

pub mod bus;
pub mod cmd;
pub mod config;
pub mod fetcher;
pub mod filters;
pub mod http_client;
pub mod models;
pub mod notifier;
pub mod persistence;
pub mod processor;
pub mod proxies;
pub mod scheduler;
pub mod supervisor;
#[cfg(feature = "test-helpers")]
pub mod test_helpers;
pub mod worker;

//! Command-line entrypoints beyond the long-running services.

pub mod admin;

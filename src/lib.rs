//! Launch layer for background workers.
//!
//! Validates the `worker` command line, patches the process I/O model for the
//! selected pool, and either starts the worker in this process or re-execs
//! it as a detached daemon with a rebuilt argument vector.

pub mod cli;
pub mod concurrency;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod nodenames;
pub mod options;
pub mod worker;

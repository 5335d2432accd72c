pub mod backend;
pub mod command;
pub mod condition;
pub mod config;
pub mod deployment;
pub mod error;
pub mod event;
pub mod facts;
pub mod flags;
pub mod host;
pub mod io;
pub mod nextcloud;
pub mod paths;
pub mod registry;
pub mod runner;
pub mod status;
pub mod storage;
pub mod system;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{HandlerFailure, ReconcileError, Result};

//! # procpool
//!
//! **Purpose**: Supervised auxiliary processes for a multiplexed server
//!
//! A [`ProcessPoolUnit`] is one managed OS process with a uniform lifecycle
//! (start, run, receive, shut down) and a socket channel back to its host.
//!
//! ## Features
//!
//! - **Registration**: Live units record their pid in a shared [`ProcessRegistry`]
//! - **Graceful Shutdown**: SIGTERM runs `on_shut_down`, deregisters and exits 0
//! - **Async Messaging**: Channel readability dispatches `on_receive` in chunks of at most 64 KiB
//! - **Failure Isolation**: Hook errors and panics go to an [`ExceptionSink`];
//!   a [`FailurePolicy`] decides whether the unit halts
//! - **Worker Binding**: Messages default to the unit's bound worker
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use procpool::{InMemoryRegistry, LocalHost, PoolConfig, TracingExceptionSink, UnitEnv};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PoolConfig::load(None)?;
//! procpool::logging::init(&config);
//!
//! let host = Arc::new(LocalHost::new());
//! let env = UnitEnv::new(
//!     host.clone(),
//!     Arc::new(InMemoryRegistry::new()),
//!     Arc::new(TracingExceptionSink),
//! );
//! // ProcessPoolUnit::new(UnitConfig::new("cron").with_pool_config(&config), hooks, env)?;
//!
//! host.spawn_all()?;
//! host.terminate_all()?;
//! # Ok(())
//! # }
//! ```

#![cfg(unix)]

pub mod boundary;
pub mod config;
mod entry;
pub mod error;
pub mod facade;
pub mod handle;
pub mod logging;
pub mod registry;
pub mod signal;
pub mod unit;

pub use boundary::{Disposition, ExceptionSink, FailurePolicy, HookFailure, HookKind, TracingExceptionSink};
pub use crate::config::{PoolConfig, UnitConfig, MAX_READ_CHUNK};
pub use error::{PoolError, Result};
pub use facade::{LocalHost, ServerFacade, WorkerId};
pub use handle::{ExitReason, LaunchMode, ProcessHandle, UnitExit, EXIT_HALTED, EXIT_SUCCESS};
pub use registry::{InMemoryRegistry, ProcessEntry, ProcessRegistry, RegistryError, RegistryKey};
pub use signal::{TerminationSignal, TerminationTrigger};
pub use unit::{ProcessPoolUnit, UnitContext, UnitEnv, UnitHooks, UnitPhase};

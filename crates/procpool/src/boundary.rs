//! Failure boundary around user hooks
//!
//! Every call into [`UnitHooks`](crate::UnitHooks) goes through [`guard`],
//! which turns returned errors and panics into a [`HookFailure`]. The
//! failure is handed to an [`ExceptionSink`] and the unit's
//! [`FailurePolicy`] decides whether the process keeps going or halts.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use thiserror::Error;
use tracing::error;

/// The hook a failure originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// `UnitHooks::run`
    Run,
    /// `UnitHooks::on_receive`
    Receive,
    /// `UnitHooks::on_shut_down`
    ShutDown,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookKind::Run => "run",
            HookKind::Receive => "on_receive",
            HookKind::ShutDown => "on_shut_down",
        };
        f.write_str(name)
    }
}

/// An uncaught failure inside a user hook
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} failed in unit '{identity}': {message}")]
pub struct HookFailure {
    /// Hook that failed
    pub kind: HookKind,
    /// Identity of the unit the hook belongs to
    pub identity: String,
    /// Human-readable description, including the cause chain
    pub message: String,
}

/// What the unit does after reporting a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep dispatching events
    Continue,
    /// Deregister and exit with the halt status
    Halt,
}

/// Maps each hook kind to a disposition
///
/// The default treats `run` and `on_shut_down` failures as fatal and
/// `on_receive` failures as recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    pub run: Disposition,
    pub receive: Disposition,
    pub shut_down: Disposition,
}

impl FailurePolicy {
    /// Disposition for a failure of the given hook
    pub fn disposition(&self, kind: HookKind) -> Disposition {
        match kind {
            HookKind::Run => self.run,
            HookKind::Receive => self.receive,
            HookKind::ShutDown => self.shut_down,
        }
    }
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            run: Disposition::Halt,
            receive: Disposition::Continue,
            shut_down: Disposition::Halt,
        }
    }
}

/// Receives failures caught at the dispatch boundary
pub trait ExceptionSink: Send + Sync {
    /// Record a hook failure
    fn report(&self, failure: &HookFailure);
}

/// Sink that reports failures through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingExceptionSink;

impl ExceptionSink for TracingExceptionSink {
    fn report(&self, failure: &HookFailure) {
        error!(
            identity = %failure.identity,
            hook = %failure.kind,
            message = %failure.message,
            "Process pool hook failed"
        );
    }
}

/// Await a hook future, converting errors and panics into a [`HookFailure`]
pub async fn guard<F>(kind: HookKind, identity: &str, hook: F) -> Result<(), HookFailure>
where
    F: Future<Output = anyhow::Result<()>>,
{
    let message = match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(err)) => format!("{err:#}"),
        Err(payload) => panic_message(payload.as_ref()),
    };

    Err(HookFailure {
        kind,
        identity: identity.to_string(),
        message,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

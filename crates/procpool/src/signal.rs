//! Termination sources observed by a unit's event loop

use std::future::pending;

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{PoolError, Result};

enum Source {
    #[cfg(unix)]
    Os(tokio::signal::unix::Signal),
    Manual(mpsc::UnboundedReceiver<()>),
}

/// Source of the termination event for one unit
///
/// Forked units listen for SIGTERM; in-process units are terminated through
/// a [`TerminationTrigger`].
pub struct TerminationSignal {
    source: Source,
}

impl TerminationSignal {
    /// Listen for SIGTERM on the current runtime
    ///
    /// Must be called from within a tokio runtime with the signal driver
    /// enabled.
    #[cfg(unix)]
    pub fn os() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let stream = signal(SignalKind::terminate()).map_err(PoolError::Signal)?;
        debug!("Installed SIGTERM handler");
        Ok(Self {
            source: Source::Os(stream),
        })
    }

    /// Create a source fired by the returned trigger
    pub fn manual() -> (TerminationTrigger, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TerminationTrigger { tx },
            Self {
                source: Source::Manual(rx),
            },
        )
    }

    /// Wait for the next termination event
    ///
    /// Never completes once the source is closed.
    pub async fn recv(&mut self) {
        let received = match &mut self.source {
            #[cfg(unix)]
            Source::Os(stream) => stream.recv().await,
            Source::Manual(rx) => rx.recv().await,
        };

        if received.is_none() {
            pending::<()>().await;
        }
    }
}

impl std::fmt::Debug for TerminationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.source {
            #[cfg(unix)]
            Source::Os(_) => "sigterm",
            Source::Manual(_) => "manual",
        };
        f.debug_struct("TerminationSignal").field("source", &kind).finish()
    }
}

/// Fires a manual [`TerminationSignal`]
#[derive(Debug, Clone)]
pub struct TerminationTrigger {
    tx: mpsc::UnboundedSender<()>,
}

impl TerminationTrigger {
    /// Deliver a termination event; returns `false` once the unit is gone
    pub fn fire(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

fn sigterm_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGTERM);
    set
}

/// Keeps SIGTERM pending on the calling thread until dropped
///
/// Held across `fork` so a child that is signalled before its handler is
/// installed sees the signal afterwards instead of dying from the default
/// action.
pub(crate) struct TerminationMask {
    previous: SigSet,
}

impl TerminationMask {
    pub(crate) fn block() -> Result<Self> {
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&sigterm_set()), Some(&mut previous))
            .map_err(|e| PoolError::Signal(e.into()))?;
        Ok(Self { previous })
    }

    /// Leave SIGTERM blocked; the forked child calls [`unblock_termination`]
    /// once its handler is in place
    pub(crate) fn keep_blocked(self) {
        std::mem::forget(self);
    }
}

impl Drop for TerminationMask {
    fn drop(&mut self) {
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            warn!(error = %e, "Failed to restore signal mask");
        }
    }
}

/// Deliver any SIGTERM held pending by [`TerminationMask`]
pub(crate) fn unblock_termination() -> Result<()> {
    pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&sigterm_set()), None)
        .map_err(|e| PoolError::Signal(e.into()))
}

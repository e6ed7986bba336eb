//! Entry callback and event loop of a started unit
//!
//! Wiring order: pid, registry entry, termination source, read watcher,
//! display name, then `run`. The loop polls the `run` hook, the termination
//! signal and channel readability in that order, so messages are served
//! and termination is honoured while `run` is still pending.

use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::net::unix::OwnedReadHalf;
use tracing::{debug, info, warn};

use crate::boundary::{guard, Disposition, HookFailure, HookKind};
use crate::error::Result;
use crate::handle::{ProcessHandle, UnitExit};
use crate::registry::ProcessEntry;
use crate::signal::TerminationSignal;
use crate::unit::{UnitContext, UnitHooks, UnitPhase, UnitShared};

/// Readability watcher over the unit's end of the channel
struct ChannelWatcher {
    reader: OwnedReadHalf,
    buf: Vec<u8>,
}

impl ChannelWatcher {
    fn new(reader: OwnedReadHalf, chunk_size: usize) -> Self {
        Self {
            reader,
            buf: vec![0u8; chunk_size],
        }
    }

    /// Wait for readiness and read at most one chunk; `None` at end of stream
    async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            self.reader.readable().await?;
            match self.reader.try_read(&mut self.buf) {
                Ok(0) => return Ok(None),
                Ok(n) => return Ok(Some(self.buf[..n].to_vec())),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

async fn next_message(watcher: &mut Option<ChannelWatcher>) -> io::Result<Option<Vec<u8>>> {
    match watcher {
        Some(watcher) => watcher.next_chunk().await,
        None => std::future::pending().await,
    }
}

async fn run_to_completion(
    running: &mut Option<BoxFuture<'_, std::result::Result<(), HookFailure>>>,
) -> std::result::Result<(), HookFailure> {
    match running {
        Some(run) => run.await,
        None => std::future::pending().await,
    }
}

/// Body of the entry callback bound at construction
pub(crate) async fn enter(
    shared: Arc<UnitShared>,
    hooks: Box<dyn UnitHooks>,
    handle: Arc<ProcessHandle>,
    pid: u32,
    mut termination: TerminationSignal,
) -> Result<UnitExit> {
    handle.assign_pid(pid);
    shared.set_phase(UnitPhase::Started);

    shared
        .env
        .registry
        .set(&shared.key, ProcessEntry { pid })?;
    info!(identity = %shared.identity, pid = pid, key = %shared.key, "Process pool unit started");

    let (reader, writer) = handle.open_channel()?.into_split();
    handle.install_writer(writer).await;

    let mut watcher = if shared.async_enabled {
        debug!(identity = %shared.identity, "Attached channel read watcher");
        Some(ChannelWatcher::new(reader, shared.read_chunk_size))
    } else {
        None
    };

    handle.set_title(&shared.display_name());

    let ctx = UnitContext::new(Arc::clone(&shared), Arc::clone(&handle));
    shared.set_phase(UnitPhase::Running);

    let mut running = Some(guard(HookKind::Run, &shared.identity, hooks.run(&ctx)).boxed());

    loop {
        tokio::select! {
            biased;

            outcome = run_to_completion(&mut running) => {
                running = None;
                match outcome {
                    Ok(()) => debug!(identity = %shared.identity, "Run hook completed"),
                    Err(failure) => {
                        if report(&shared, &failure) == Disposition::Halt {
                            return halt(&shared, watcher, HookKind::Run);
                        }
                    }
                }
            }

            _ = termination.recv() => {
                if running.take().is_some() {
                    debug!(identity = %shared.identity, "Cancelled pending run hook");
                }
                return shut_down(&shared, hooks.as_ref(), watcher).await;
            }

            read = next_message(&mut watcher) => {
                match read {
                    Ok(Some(message)) => {
                        debug!(identity = %shared.identity, bytes = message.len(), "Dispatching message");
                        let received = guard(
                            HookKind::Receive,
                            &shared.identity,
                            hooks.on_receive(message, &ctx),
                        )
                        .await;

                        if let Err(failure) = received {
                            if report(&shared, &failure) == Disposition::Halt {
                                return halt(&shared, watcher, HookKind::Receive);
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(identity = %shared.identity, "Channel closed by peer, detaching watcher");
                        watcher = None;
                    }
                    Err(e) => {
                        warn!(identity = %shared.identity, error = %e, "Channel read failed, detaching watcher");
                        watcher = None;
                    }
                }
            }
        }
    }
}

fn report(shared: &UnitShared, failure: &HookFailure) -> Disposition {
    shared.env.sink.report(failure);
    shared.env.policy.disposition(failure.kind)
}

async fn shut_down(
    shared: &UnitShared,
    hooks: &dyn UnitHooks,
    watcher: Option<ChannelWatcher>,
) -> Result<UnitExit> {
    shared.set_phase(UnitPhase::ShuttingDown);
    info!(identity = %shared.identity, "Termination signal received");

    let outcome = guard(HookKind::ShutDown, &shared.identity, hooks.on_shut_down()).await;
    let disposition = match &outcome {
        Ok(()) => Disposition::Continue,
        Err(failure) => report(shared, failure),
    };

    shared.env.registry.delete(&shared.key)?;
    drop(watcher);

    if disposition == Disposition::Halt {
        shared.set_phase(UnitPhase::Halted);
        return Ok(UnitExit::halted(HookKind::ShutDown));
    }

    shared.set_phase(UnitPhase::Terminated);
    info!(identity = %shared.identity, "Process pool unit terminated");
    Ok(UnitExit::terminated())
}

fn halt(
    shared: &UnitShared,
    watcher: Option<ChannelWatcher>,
    kind: HookKind,
) -> Result<UnitExit> {
    shared.env.registry.delete(&shared.key)?;
    drop(watcher);

    shared.set_phase(UnitPhase::Halted);
    warn!(identity = %shared.identity, hook = %kind, "Process pool unit halted");
    Ok(UnitExit::halted(kind))
}

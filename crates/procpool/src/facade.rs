//! Hosting server interface

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{PoolError, Result};
use crate::handle::ProcessHandle;

/// Worker peer identifier
pub type WorkerId = u32;

/// The server runtime that owns managed processes and routes messages
#[async_trait]
pub trait ServerFacade: Send + Sync {
    /// Take ownership of a unit's process for launching
    fn add_process(&self, handle: Arc<ProcessHandle>) -> Result<()>;

    /// Deliver `payload` to worker `worker_id`
    async fn send_message(&self, payload: Vec<u8>, worker_id: WorkerId) -> Result<bool>;
}

/// In-process host
///
/// Keeps the process table, delivers messages to worker mailboxes living
/// in the same address space and launches registered units.
#[derive(Debug, Default)]
pub struct LocalHost {
    processes: Mutex<Vec<Arc<ProcessHandle>>>,
    workers: DashMap<WorkerId, mpsc::UnboundedSender<Vec<u8>>>,
}

impl LocalHost {
    /// Create an empty host
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the mailbox of worker `worker_id`
    ///
    /// Replaces any previous mailbox for the same id.
    pub fn register_worker(&self, worker_id: WorkerId) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.workers.insert(worker_id, tx);
        debug!(worker_id = worker_id, "Registered worker mailbox");
        rx
    }

    /// Registered process handles, in registration order
    pub fn processes(&self) -> Vec<Arc<ProcessHandle>> {
        self.processes.lock().clone()
    }

    /// Number of registered processes
    pub fn process_count(&self) -> usize {
        self.processes.lock().len()
    }

    /// Fork every registered unit that has not started yet
    ///
    /// Call before creating a multi-threaded runtime in this process.
    pub fn spawn_all(&self) -> Result<Vec<u32>> {
        let mut pids = Vec::new();
        for handle in self.processes() {
            if handle.is_started() {
                continue;
            }
            pids.push(handle.spawn()?);
        }
        info!(count = pids.len(), "Spawned process pool units");
        Ok(pids)
    }

    /// Send SIGTERM to every forked unit and collect exit codes
    ///
    /// Units killed by a signal report `128 + signo`.
    pub fn terminate_all(&self) -> Result<Vec<(u32, i32)>> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let mut statuses = Vec::new();
        for handle in self.processes() {
            let Some(pid) = handle.pid() else {
                continue;
            };
            if handle.launch_mode() != Some(crate::handle::LaunchMode::Forked) {
                continue;
            }

            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid = %pid, error = %e, "Failed to send SIGTERM");
                continue;
            }

            if let Some(code) = reap(pid)? {
                debug!(pid = %pid, code = code, "Process pool unit exited");
                statuses.push((pid, code));
            }
        }
        Ok(statuses)
    }
}

/// Wait for `pid` to exit; signalled processes report `128 + signo`
fn reap(pid: u32) -> Result<Option<i32>> {
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::Pid;

    match waitpid(Pid::from_raw(pid as i32), None) {
        Ok(WaitStatus::Exited(_, code)) => Ok(Some(code)),
        Ok(WaitStatus::Signaled(_, signal, _)) => Ok(Some(128 + signal as i32)),
        Ok(other) => {
            warn!(pid = %pid, status = ?other, "Unexpected wait status");
            Ok(None)
        }
        Err(e) => Err(PoolError::WaitFailed(e.into())),
    }
}

#[async_trait]
impl ServerFacade for LocalHost {
    fn add_process(&self, handle: Arc<ProcessHandle>) -> Result<()> {
        debug!(identity = %handle.label(), "Added process to host");
        self.processes.lock().push(handle);
        Ok(())
    }

    async fn send_message(&self, payload: Vec<u8>, worker_id: WorkerId) -> Result<bool> {
        let Some(mailbox) = self.workers.get(&worker_id).map(|tx| tx.clone()) else {
            debug!(worker_id = worker_id, "No mailbox for worker");
            return Ok(false);
        };
        Ok(mailbox.send(payload).is_ok())
    }
}

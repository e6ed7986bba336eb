//! OS process handle owned by a unit
//!
//! A handle owns the unit's channel (a Unix socket pair), the one-shot
//! entry callback and the pid cell. The hosting side keeps the parent end
//! of the channel; the started unit takes the child end.

use std::fmt;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tracing::{debug, error, info, warn};

use crate::boundary::HookKind;
use crate::error::{PoolError, Result};
use crate::signal::{unblock_termination, TerminationMask, TerminationSignal};

/// Exit status after a termination signal
pub const EXIT_SUCCESS: i32 = 0;

/// Exit status after a fatal hook failure or broken wiring
pub const EXIT_HALTED: i32 = 1;

pub(crate) type EntryFn = Box<
    dyn FnOnce(Arc<ProcessHandle>, u32, TerminationSignal) -> BoxFuture<'static, Result<UnitExit>>
        + Send,
>;

/// How a handle's entry callback was launched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Entry runs in a forked child process
    Forked,
    /// Entry runs on the caller's runtime
    InProcess,
}

/// Why a unit stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The termination signal was handled
    Terminated,
    /// A hook failure was fatal under the unit's policy
    Halted(HookKind),
}

/// Final status of a unit's entry callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitExit {
    pub code: i32,
    pub reason: ExitReason,
}

impl UnitExit {
    pub(crate) fn terminated() -> Self {
        Self {
            code: EXIT_SUCCESS,
            reason: ExitReason::Terminated,
        }
    }

    pub(crate) fn halted(kind: HookKind) -> Self {
        Self {
            code: EXIT_HALTED,
            reason: ExitReason::Halted(kind),
        }
    }

    /// Whether the unit exited with the success status
    pub fn success(&self) -> bool {
        self.code == EXIT_SUCCESS
    }
}

/// Handle to the OS process backing a unit
pub struct ProcessHandle {
    label: String,
    pid: OnceLock<u32>,
    mode: OnceLock<LaunchMode>,
    entry: Mutex<Option<EntryFn>>,
    parent_end: Mutex<Option<StdUnixStream>>,
    child_end: Mutex<Option<StdUnixStream>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    title: Mutex<Option<String>>,
}

impl ProcessHandle {
    /// Allocate the channel and bind the entry callback
    pub(crate) fn new(label: impl Into<String>, entry: EntryFn) -> Result<Arc<Self>> {
        let (parent_end, child_end) =
            StdUnixStream::pair().map_err(PoolError::ConstructionFailure)?;

        Ok(Arc::new(Self {
            label: label.into(),
            pid: OnceLock::new(),
            mode: OnceLock::new(),
            entry: Mutex::new(Some(entry)),
            parent_end: Mutex::new(Some(parent_end)),
            child_end: Mutex::new(Some(child_end)),
            writer: tokio::sync::Mutex::new(None),
            title: Mutex::new(None),
        }))
    }

    /// Identity of the owning unit
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Process id, `None` until started
    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// Whether the handle has been started
    pub fn is_started(&self) -> bool {
        self.pid.get().is_some()
    }

    /// Launch mode, `None` until started
    pub fn launch_mode(&self) -> Option<LaunchMode> {
        self.mode.get().copied()
    }

    /// Display title set by the entry callback
    pub fn title(&self) -> Option<String> {
        self.title.lock().clone()
    }

    /// Run the entry callback on the current runtime
    ///
    /// The unit behaves as if `pid` were its process id. Completes when the
    /// unit terminates or halts.
    pub async fn run_in_process(
        self: &Arc<Self>,
        pid: u32,
        termination: TerminationSignal,
    ) -> Result<UnitExit> {
        let entry = self.take_entry()?;
        let _ = self.mode.set(LaunchMode::InProcess);
        entry(Arc::clone(self), pid, termination).await
    }

    /// Fork a child process that runs the entry callback
    ///
    /// Call before the parent starts a multi-threaded runtime. The child
    /// builds its own current-thread runtime, listens for SIGTERM and exits
    /// with the unit's status; it never returns from this call. SIGTERM is
    /// held pending in the child until its handler is installed, so the
    /// unit may be terminated as soon as this returns.
    pub fn spawn(self: &Arc<Self>) -> Result<u32> {
        use nix::unistd::{fork, ForkResult};

        let mask = TerminationMask::block()?;
        let entry = self.take_entry()?;

        // SAFETY: the child drops straight into `run_forked` and exits without
        // returning to the caller's stack.
        match unsafe { fork() }.map_err(|e| PoolError::SpawnFailed(e.to_string()))? {
            ForkResult::Parent { child } => {
                drop(mask);
                let pid = child.as_raw() as u32;
                let _ = self.pid.set(pid);
                let _ = self.mode.set(LaunchMode::Forked);
                self.child_end.lock().take();
                info!(pid = %pid, identity = %self.label, "Process pool unit forked");
                Ok(pid)
            }
            ForkResult::Child => {
                mask.keep_blocked();
                let _ = self.mode.set(LaunchMode::Forked);
                self.parent_end.lock().take();
                let handle = Arc::clone(self);
                let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
                    run_forked(handle, entry)
                }))
                .unwrap_or(EXIT_HALTED);
                std::process::exit(code)
            }
        }
    }

    /// Write to the unit from the hosting side
    pub fn write_to_child(&self, data: &[u8]) -> Result<usize> {
        let mut guard = self.parent_end.lock();
        let stream = guard
            .as_mut()
            .ok_or(PoolError::ChannelUnavailable("parent end is not held here"))?;
        stream.write_all(data)?;
        Ok(data.len())
    }

    /// Read what the unit wrote, blocking up to `timeout`
    pub fn read_from_child(&self, max: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut guard = self.parent_end.lock();
        let stream = guard
            .as_mut()
            .ok_or(PoolError::ChannelUnavailable("parent end is not held here"))?;
        stream.set_read_timeout(timeout)?;

        let mut buf = vec![0u8; max];
        let n = stream.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write to the hosting side from inside the started unit
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or(PoolError::ChannelUnavailable("unit has not started"))?;
        writer.write_all(data).await?;
        Ok(data.len())
    }

    fn take_entry(&self) -> Result<EntryFn> {
        self.entry.lock().take().ok_or(PoolError::AlreadyStarted)
    }

    pub(crate) fn assign_pid(&self, pid: u32) {
        if self.pid.set(pid).is_err() && self.pid() != Some(pid) {
            warn!(
                identity = %self.label,
                existing = ?self.pid(),
                requested = pid,
                "Ignoring second pid assignment"
            );
        }
    }

    /// Take the child end and attach it to the current runtime
    pub(crate) fn open_channel(&self) -> Result<UnixStream> {
        let stream = self
            .child_end
            .lock()
            .take()
            .ok_or(PoolError::ChannelUnavailable("child end already taken"))?;
        stream.set_nonblocking(true)?;
        Ok(UnixStream::from_std(stream)?)
    }

    pub(crate) async fn install_writer(&self, writer: OwnedWriteHalf) {
        *self.writer.lock().await = Some(writer);
    }

    /// Record the display title
    ///
    /// Forked units on Linux also rename their thread. The kernel keeps
    /// only 15 bytes of that name, so it carries the identity; the full
    /// title stays on the handle.
    pub(crate) fn set_title(&self, title: &str) {
        *self.title.lock() = Some(title.to_string());

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if self.launch_mode() == Some(LaunchMode::Forked) {
            let applied = std::ffi::CString::new(kernel_name(&self.label))
                .map_err(|e| e.to_string())
                .and_then(|name| nix::sys::prctl::set_name(&name).map_err(|e| e.to_string()));
            if let Err(e) = applied {
                debug!(identity = %self.label, error = %e, "Failed to set process name");
            }
        }
    }
}

/// Longest thread name the kernel stores, without the trailing NUL
#[cfg(any(target_os = "linux", target_os = "android"))]
const KERNEL_NAME_MAX: usize = 15;

#[cfg(any(target_os = "linux", target_os = "android"))]
fn kernel_name(identity: &str) -> &str {
    if identity.len() <= KERNEL_NAME_MAX {
        return identity;
    }
    let mut end = KERNEL_NAME_MAX;
    while !identity.is_char_boundary(end) {
        end -= 1;
    }
    &identity[..end]
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("label", &self.label)
            .field("pid", &self.pid())
            .field("mode", &self.launch_mode())
            .field("title", &self.title())
            .finish_non_exhaustive()
    }
}

fn run_forked(handle: Arc<ProcessHandle>, entry: EntryFn) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(identity = %handle.label, error = %e, "Failed to build unit runtime");
            return EXIT_HALTED;
        }
    };

    runtime.block_on(async move {
        let termination = match TerminationSignal::os() {
            Ok(termination) => termination,
            Err(e) => {
                error!(identity = %handle.label, error = %e, "Failed to arm termination signal");
                return EXIT_HALTED;
            }
        };
        if let Err(e) = unblock_termination() {
            error!(identity = %handle.label, error = %e, "Failed to unblock termination signal");
            return EXIT_HALTED;
        }

        let label = handle.label.clone();
        match entry(handle, std::process::id(), termination).await {
            Ok(exit) => exit.code,
            Err(e) => {
                error!(identity = %label, error = %e, "Process pool unit wiring failed");
                EXIT_HALTED
            }
        }
    })
}

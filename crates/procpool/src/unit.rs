//! Process pool unit
//!
//! A [`ProcessPoolUnit`] ties one [`ProcessHandle`] to a set of
//! [`UnitHooks`]. Construction registers the handle with the hosting
//! [`ServerFacade`]; the hooks only run once the handle is started.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use procpool::{
//!     InMemoryRegistry, LocalHost, ProcessPoolUnit, TracingExceptionSink,
//!     UnitConfig, UnitContext, UnitEnv, UnitHooks,
//! };
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl UnitHooks for Echo {
//!     async fn run(&self, _ctx: &UnitContext) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn on_shut_down(&self) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn on_receive(&self, message: Vec<u8>, ctx: &UnitContext) -> anyhow::Result<()> {
//!         ctx.handle().write(&message).await?;
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let host = Arc::new(LocalHost::new());
//! let env = UnitEnv::new(
//!     host.clone(),
//!     Arc::new(InMemoryRegistry::new()),
//!     Arc::new(TracingExceptionSink),
//! );
//! let unit = ProcessPoolUnit::new(UnitConfig::new("echo"), Echo, env)?;
//! unit.set_bound_worker_id(0);
//!
//! host.spawn_all()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::boundary::{ExceptionSink, FailurePolicy};
use crate::config::UnitConfig;
use crate::entry;
use crate::error::{PoolError, Result};
use crate::facade::{ServerFacade, WorkerId};
use crate::handle::{EntryFn, ProcessHandle};
use crate::registry::{ProcessRegistry, RegistryKey};
use crate::signal::TerminationSignal;

/// User-supplied behaviour of a unit
///
/// Hooks take `&self` because `run` stays in flight while `on_receive`
/// and `on_shut_down` are dispatched; keep mutable state behind a lock or
/// atomics. Errors and panics escaping a hook are caught by the unit and
/// reported to its [`ExceptionSink`].
#[async_trait]
pub trait UnitHooks: Send + Sync + 'static {
    /// Main body, called once after all wiring is in place
    ///
    /// Polled on the unit's event loop next to the channel and the
    /// termination signal. It may run for the life of the unit; the
    /// termination signal cancels it at its next await point.
    async fn run(&self, ctx: &UnitContext) -> anyhow::Result<()>;

    /// Called once when the termination signal arrives, before the unit
    /// deregisters; must not block
    async fn on_shut_down(&self) -> anyhow::Result<()>;

    /// Called for every chunk read from the channel (async units only)
    async fn on_receive(&self, message: Vec<u8>, ctx: &UnitContext) -> anyhow::Result<()>;
}

/// Lifecycle phase of a unit, as observed in the current process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitPhase {
    Dormant,
    Started,
    Running,
    ShuttingDown,
    Terminated,
    Halted,
}

/// Collaborators injected into a unit
#[derive(Clone)]
pub struct UnitEnv {
    pub facade: Arc<dyn ServerFacade>,
    pub registry: Arc<dyn ProcessRegistry>,
    pub sink: Arc<dyn ExceptionSink>,
    pub policy: FailurePolicy,
}

impl UnitEnv {
    /// Bundle collaborators with the default failure policy
    pub fn new(
        facade: Arc<dyn ServerFacade>,
        registry: Arc<dyn ProcessRegistry>,
        sink: Arc<dyn ExceptionSink>,
    ) -> Self {
        Self {
            facade,
            registry,
            sink,
            policy: FailurePolicy::default(),
        }
    }

    /// Replace the failure policy
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl fmt::Debug for UnitEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitEnv")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// State shared by a unit, its entry callback and its contexts
pub(crate) struct UnitShared {
    pub(crate) identity: String,
    pub(crate) key: RegistryKey,
    pub(crate) async_enabled: bool,
    pub(crate) args: Vec<Value>,
    pub(crate) name_prefix: String,
    pub(crate) read_chunk_size: usize,
    pub(crate) bound_worker: OnceLock<WorkerId>,
    pub(crate) phase: Mutex<UnitPhase>,
    pub(crate) env: UnitEnv,
}

impl UnitShared {
    pub(crate) fn set_phase(&self, phase: UnitPhase) {
        debug!(identity = %self.identity, phase = ?phase, "Unit phase changed");
        *self.phase.lock() = phase;
    }

    pub(crate) fn display_name(&self) -> String {
        let worker = self
            .bound_worker
            .get()
            .map(|id| id.to_string())
            .unwrap_or_default();
        format!("{}_of_worker{}:{}", self.name_prefix, worker, self.identity)
    }

    async fn send_message(&self, payload: &[u8], worker_id: Option<WorkerId>) -> Result<bool> {
        if payload.is_empty() {
            return Err(PoolError::InvalidArgument(
                "message can not be null or empty".to_string(),
            ));
        }

        let worker_id = worker_id
            .or_else(|| self.bound_worker.get().copied())
            .ok_or_else(|| PoolError::NotBound {
                identity: self.identity.clone(),
            })?;

        debug!(
            identity = %self.identity,
            worker_id = worker_id,
            bytes = payload.len(),
            "Sending message to worker"
        );
        self.env
            .facade
            .send_message(payload.to_vec(), worker_id)
            .await
    }
}

/// View of a started unit handed to its hooks
#[derive(Clone)]
pub struct UnitContext {
    shared: Arc<UnitShared>,
    handle: Arc<ProcessHandle>,
}

impl UnitContext {
    pub(crate) fn new(shared: Arc<UnitShared>, handle: Arc<ProcessHandle>) -> Self {
        Self { shared, handle }
    }

    /// The unit's process handle
    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    pub fn args(&self) -> &[Value] {
        &self.shared.args
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    pub fn bound_worker_id(&self) -> Option<WorkerId> {
        self.shared.bound_worker.get().copied()
    }

    /// Send a message to a worker; see [`ProcessPoolUnit::send_message`]
    pub async fn send_message(
        &self,
        message: impl AsRef<[u8]>,
        worker_id: Option<WorkerId>,
    ) -> Result<bool> {
        self.shared.send_message(message.as_ref(), worker_id).await
    }
}

impl fmt::Debug for UnitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitContext")
            .field("identity", &self.shared.identity)
            .field("handle", &self.handle)
            .finish()
    }
}

/// One managed process plus its lifecycle hooks
pub struct ProcessPoolUnit {
    shared: Arc<UnitShared>,
    handle: Arc<ProcessHandle>,
}

impl ProcessPoolUnit {
    /// Create a unit and register its process with the host
    ///
    /// Fails if the configuration is invalid, the channel can not be
    /// allocated or the host refuses the process.
    pub fn new<H: UnitHooks>(config: UnitConfig, hooks: H, env: UnitEnv) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(UnitShared {
            key: RegistryKey::for_identity(&config.identity),
            identity: config.identity,
            async_enabled: config.async_enabled,
            args: config.args,
            name_prefix: config.name_prefix,
            read_chunk_size: config.read_chunk_size,
            bound_worker: OnceLock::new(),
            phase: Mutex::new(UnitPhase::Dormant),
            env,
        });

        let entry_shared = Arc::clone(&shared);
        let entry: EntryFn = Box::new(
            move |handle: Arc<ProcessHandle>, pid: u32, termination: TerminationSignal| {
                entry::enter(entry_shared, Box::new(hooks), handle, pid, termination).boxed()
            },
        );

        let handle = ProcessHandle::new(shared.identity.clone(), entry)?;
        shared.env.facade.add_process(Arc::clone(&handle))?;

        debug!(
            identity = %shared.identity,
            key = %shared.key,
            async_enabled = shared.async_enabled,
            "Created process pool unit"
        );

        Ok(Self { shared, handle })
    }

    /// The unit's process handle
    pub fn handle(&self) -> &Arc<ProcessHandle> {
        &self.handle
    }

    /// Process id, `None` until the unit has started
    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    /// Bind the worker that receives this unit's messages by default
    ///
    /// Must be called before the unit starts. Once a worker is bound, or
    /// after start, further calls are ignored.
    pub fn set_bound_worker_id(&self, worker_id: WorkerId) {
        if self.handle.is_started() {
            warn!(
                identity = %self.shared.identity,
                worker_id = worker_id,
                "Ignoring worker binding after start"
            );
            return;
        }

        if self.shared.bound_worker.set(worker_id).is_err() {
            warn!(
                identity = %self.shared.identity,
                worker_id = worker_id,
                bound = ?self.bound_worker_id(),
                "Unit is already bound to a worker"
            );
        }
    }

    pub fn bound_worker_id(&self) -> Option<WorkerId> {
        self.shared.bound_worker.get().copied()
    }

    pub fn args(&self) -> &[Value] {
        &self.shared.args
    }

    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    /// Registry key derived from the identity
    pub fn registry_key(&self) -> &RegistryKey {
        &self.shared.key
    }

    pub fn is_async(&self) -> bool {
        self.shared.async_enabled
    }

    pub fn phase(&self) -> UnitPhase {
        *self.shared.phase.lock()
    }

    /// Name the started process displays: `<prefix>_of_worker<id>:<identity>`
    pub fn display_name(&self) -> String {
        self.shared.display_name()
    }

    /// Send `message` to `worker_id`, or to the bound worker when `None`
    ///
    /// Empty messages are rejected with [`PoolError::InvalidArgument`] and a
    /// missing worker id with [`PoolError::NotBound`], both before the host
    /// is contacted. Otherwise returns whatever the host reports.
    pub async fn send_message(
        &self,
        message: impl AsRef<[u8]>,
        worker_id: Option<WorkerId>,
    ) -> Result<bool> {
        self.shared.send_message(message.as_ref(), worker_id).await
    }
}

impl fmt::Debug for ProcessPoolUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessPoolUnit")
            .field("identity", &self.shared.identity)
            .field("async", &self.shared.async_enabled)
            .field("bound_worker_id", &self.bound_worker_id())
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::TracingExceptionSink;
    use crate::registry::InMemoryRegistry;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Idle;

    #[async_trait]
    impl UnitHooks for Idle {
        async fn run(&self, _ctx: &UnitContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_shut_down(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_receive(&self, _message: Vec<u8>, _ctx: &UnitContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Facade that counts deliveries and reports a fixed outcome
    #[derive(Default)]
    struct CountingFacade {
        added: AtomicUsize,
        sent: Mutex<Vec<(Vec<u8>, WorkerId)>>,
        refuse_processes: bool,
        outcome: bool,
    }

    #[async_trait]
    impl ServerFacade for CountingFacade {
        fn add_process(&self, _handle: Arc<ProcessHandle>) -> Result<()> {
            if self.refuse_processes {
                return Err(PoolError::Transport("process table full".to_string()));
            }
            self.added.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_message(&self, payload: Vec<u8>, worker_id: WorkerId) -> Result<bool> {
            self.sent.lock().push((payload, worker_id));
            Ok(self.outcome)
        }
    }

    fn env_with(facade: Arc<CountingFacade>) -> UnitEnv {
        UnitEnv::new(
            facade,
            Arc::new(InMemoryRegistry::new()),
            Arc::new(TracingExceptionSink),
        )
    }

    fn facade(outcome: bool) -> Arc<CountingFacade> {
        Arc::new(CountingFacade {
            outcome,
            ..Default::default()
        })
    }

    #[test]
    fn test_construction_registers_process() {
        let facade = facade(true);
        let unit = ProcessPoolUnit::new(
            UnitConfig::new("cron").args([json!(1), json!("x")]),
            Idle,
            env_with(facade.clone()),
        )
        .unwrap();

        assert_eq!(facade.added.load(Ordering::SeqCst), 1);
        assert_eq!(unit.identity(), "cron");
        assert_eq!(unit.args(), &[json!(1), json!("x")]);
        assert_eq!(unit.registry_key(), &RegistryKey::for_identity("cron"));
        assert!(unit.is_async());
        assert_eq!(unit.pid(), None);
        assert_eq!(unit.phase(), UnitPhase::Dormant);
        assert_eq!(unit.handle().label(), "cron");
    }

    #[test]
    fn test_construction_propagates_host_refusal() {
        let facade = Arc::new(CountingFacade {
            refuse_processes: true,
            ..Default::default()
        });
        let result = ProcessPoolUnit::new(UnitConfig::new("cron"), Idle, env_with(facade));
        assert!(matches!(result, Err(PoolError::Transport(_))));
    }

    #[test]
    fn test_construction_rejects_empty_identity() {
        let facade = facade(true);
        let result = ProcessPoolUnit::new(UnitConfig::new(""), Idle, env_with(facade.clone()));
        assert!(matches!(result, Err(PoolError::InvalidArgument(_))));
        assert_eq!(facade.added.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_display_name() {
        let unit =
            ProcessPoolUnit::new(UnitConfig::new("cron"), Idle, env_with(facade(true))).unwrap();
        assert_eq!(unit.display_name(), "procpool-ProcessPools_of_worker:cron");

        unit.set_bound_worker_id(4);
        assert_eq!(unit.display_name(), "procpool-ProcessPools_of_worker4:cron");
    }

    #[test]
    fn test_bound_worker_is_set_once() {
        let unit =
            ProcessPoolUnit::new(UnitConfig::new("cron"), Idle, env_with(facade(true))).unwrap();
        assert_eq!(unit.bound_worker_id(), None);

        unit.set_bound_worker_id(2);
        unit.set_bound_worker_id(5);
        assert_eq!(unit.bound_worker_id(), Some(2));
    }

    #[tokio::test]
    async fn test_binding_ignored_after_start() {
        let unit =
            ProcessPoolUnit::new(UnitConfig::new("cron"), Idle, env_with(facade(true))).unwrap();
        let (trigger, termination) = TerminationSignal::manual();
        trigger.fire();

        let exit = unit
            .handle()
            .run_in_process(11, termination)
            .await
            .unwrap();
        assert!(exit.success());

        unit.set_bound_worker_id(3);
        assert_eq!(unit.bound_worker_id(), None);
        assert_eq!(unit.pid(), Some(11));
    }

    #[tokio::test]
    async fn test_send_empty_message_is_rejected() {
        let facade = facade(true);
        let unit =
            ProcessPoolUnit::new(UnitConfig::new("cron"), Idle, env_with(facade.clone())).unwrap();
        unit.set_bound_worker_id(1);

        let result = unit.send_message(b"", None).await;
        assert!(matches!(result, Err(PoolError::InvalidArgument(_))));
        let result = unit.send_message("", Some(1)).await;
        assert!(matches!(result, Err(PoolError::InvalidArgument(_))));
        assert!(facade.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_send_without_worker_is_not_bound() {
        let facade = facade(true);
        let unit =
            ProcessPoolUnit::new(UnitConfig::new("cron"), Idle, env_with(facade.clone())).unwrap();

        let result = unit.send_message("x", None).await;
        assert!(matches!(result, Err(PoolError::NotBound { .. })));
        assert!(facade.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_send_resolves_bound_worker() {
        let facade = facade(true);
        let unit =
            ProcessPoolUnit::new(UnitConfig::new("cron"), Idle, env_with(facade.clone())).unwrap();
        unit.set_bound_worker_id(6);

        assert!(unit.send_message("tick", None).await.unwrap());
        assert!(unit.send_message(vec![1u8, 2], Some(8)).await.unwrap());

        let sent = facade.sent.lock().clone();
        assert_eq!(sent, vec![(b"tick".to_vec(), 6), (vec![1, 2], 8)]);
    }

    #[tokio::test]
    async fn test_send_reports_host_outcome() {
        let facade = facade(false);
        let unit =
            ProcessPoolUnit::new(UnitConfig::new("cron"), Idle, env_with(facade.clone())).unwrap();

        assert!(!unit.send_message("tick", Some(1)).await.unwrap());
        assert_eq!(facade.sent.lock().len(), 1);
    }

    #[test]
    fn test_env_policy_override() {
        use crate::boundary::Disposition;

        let policy = FailurePolicy {
            receive: Disposition::Halt,
            ..Default::default()
        };
        let env = env_with(facade(true)).with_policy(policy);
        assert_eq!(env.policy.receive, Disposition::Halt);
        assert_eq!(env.policy.run, Disposition::Halt);
    }
}

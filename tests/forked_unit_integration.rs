//! Integration tests for units running in forked processes
//!
//! The parent talks to each child over its channel and stops it with
//! SIGTERM, then checks the exit status reported by `waitpid`.

#![cfg(target_os = "linux")]

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use procpool::{
    InMemoryRegistry, LaunchMode, LocalHost, ProcessPoolUnit, TracingExceptionSink, UnitConfig,
    UnitContext, UnitEnv, UnitHooks,
};
use serial_test::serial;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

struct Echo;

#[async_trait]
impl UnitHooks for Echo {
    async fn run(&self, _ctx: &UnitContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_shut_down(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_receive(&self, message: Vec<u8>, ctx: &UnitContext) -> anyhow::Result<()> {
        let mut reply = format!("{}:", ctx.pid().unwrap_or_default()).into_bytes();
        reply.extend_from_slice(&message);
        ctx.handle().write(&reply).await?;
        Ok(())
    }
}

struct Doomed;

#[async_trait]
impl UnitHooks for Doomed {
    async fn run(&self, ctx: &UnitContext) -> anyhow::Result<()> {
        ctx.handle().write(b"started").await?;
        bail!("cannot open spool directory")
    }

    async fn on_shut_down(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_receive(&self, _message: Vec<u8>, _ctx: &UnitContext) -> anyhow::Result<()> {
        Ok(())
    }
}

fn env(host: &Arc<LocalHost>) -> UnitEnv {
    UnitEnv::new(
        host.clone(),
        Arc::new(InMemoryRegistry::new()),
        Arc::new(TracingExceptionSink),
    )
}

#[test]
#[serial]
fn test_forked_unit_echoes_and_terminates_cleanly() {
    let host = Arc::new(LocalHost::new());
    let unit = ProcessPoolUnit::new(UnitConfig::new("echo-unit"), Echo, env(&host)).unwrap();
    assert_eq!(unit.pid(), None);

    let pids = host.spawn_all().unwrap();
    assert_eq!(pids.len(), 1);
    assert_eq!(unit.pid(), Some(pids[0]));
    assert_eq!(unit.handle().launch_mode(), Some(LaunchMode::Forked));

    unit.handle().write_to_child(b"ping").unwrap();
    let reply = unit
        .handle()
        .read_from_child(256, Some(REPLY_TIMEOUT))
        .unwrap();
    assert_eq!(reply, format!("{}:ping", pids[0]).into_bytes());

    let comm = std::fs::read_to_string(format!("/proc/{}/comm", pids[0])).unwrap();
    assert_eq!(comm.trim_end(), "echo-unit");

    let statuses = host.terminate_all().unwrap();
    assert_eq!(statuses, vec![(pids[0], 0)]);
}

#[test]
#[serial]
fn test_forked_unit_halts_when_run_fails() {
    let host = Arc::new(LocalHost::new());
    let unit =
        ProcessPoolUnit::new(UnitConfig::new("doomed-unit").async_enabled(false), Doomed, env(&host))
            .unwrap();

    let pids = host.spawn_all().unwrap();
    let started = unit
        .handle()
        .read_from_child(64, Some(REPLY_TIMEOUT))
        .unwrap();
    assert_eq!(started, b"started");

    let statuses = host.terminate_all().unwrap();
    assert_eq!(statuses, vec![(pids[0], 1)]);
}

#[test]
#[serial]
fn test_spawn_all_skips_started_units() {
    let host = Arc::new(LocalHost::new());
    let unit = ProcessPoolUnit::new(UnitConfig::new("single"), Echo, env(&host)).unwrap();

    let first = host.spawn_all().unwrap();
    let second = host.spawn_all().unwrap();
    assert_eq!(first.len(), 1);
    assert!(second.is_empty());

    unit.handle().write_to_child(b"sync").unwrap();
    unit.handle()
        .read_from_child(256, Some(REPLY_TIMEOUT))
        .unwrap();

    let statuses = host.terminate_all().unwrap();
    assert_eq!(statuses, vec![(first[0], 0)]);
}

#[test]
#[serial]
fn test_termination_right_after_spawn_shuts_down_cleanly() {
    for _ in 0..10 {
        let host = Arc::new(LocalHost::new());
        let _unit = ProcessPoolUnit::new(UnitConfig::new("short-lived"), Echo, env(&host)).unwrap();

        let pids = host.spawn_all().unwrap();
        let statuses = host.terminate_all().unwrap();
        assert_eq!(statuses, vec![(pids[0], 0)]);
    }
}

//! In-process container engine for integration tests
//!
//! Containers are plain records. `exec` looks up the script written into the
//! container and asks a test-supplied program function what the guest does.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stratbox_core::runtime::{
    ContainerEngine, ContainerId, ContainerSpec, EngineError, ExecOutput, ResourceStats,
};
use tokio_util::sync::CancellationToken;

/// What the guest does when run
#[derive(Debug, Clone)]
pub enum GuestRun {
    /// Exit after the engine's exec delay
    Exit {
        stdout: String,
        stderr: String,
        code: i32,
    },
    /// Never finish
    Hang,
    /// Never finish while reporting this much memory
    MemoryHog(u64),
    /// Killed by the engine's memory cap
    OomKill,
}

impl GuestRun {
    pub fn stdout(text: impl Into<String>) -> Self {
        GuestRun::Exit {
            stdout: text.into(),
            stderr: String::new(),
            code: 0,
        }
    }

    pub fn failure(stderr: impl Into<String>, code: i32) -> Self {
        GuestRun::Exit {
            stdout: String::new(),
            stderr: stderr.into(),
            code,
        }
    }
}

type Program = dyn Fn(&str, &[u8]) -> GuestRun + Send + Sync;

#[derive(Default)]
struct Container {
    files: HashMap<String, Vec<u8>>,
    killed: CancellationToken,
    memory_bytes: u64,
}

#[derive(Default)]
struct State {
    next_id: usize,
    containers: HashMap<String, Container>,
    specs: Vec<ContainerSpec>,
    removals: HashMap<String, usize>,
    kills: usize,
    peak_alive: usize,
}

/// Scripted engine that records every lifecycle call
pub struct FakeEngine {
    program: Box<Program>,
    exec_delay: Duration,
    fail_create: bool,
    panic_on_create: bool,
    hang_writes: bool,
    state: Mutex<State>,
}

impl FakeEngine {
    pub fn new(program: impl Fn(&str, &[u8]) -> GuestRun + Send + Sync + 'static) -> Self {
        Self {
            program: Box::new(program),
            exec_delay: Duration::from_millis(10),
            fail_create: false,
            panic_on_create: false,
            hang_writes: false,
            state: Mutex::new(State::default()),
        }
    }

    /// Engine whose guests print a fixed line
    pub fn printing(line: &'static str) -> Self {
        Self::new(move |_, _| GuestRun::stdout(line))
    }

    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// Engine bug: `create` panics instead of returning an error
    pub fn panicking_create(mut self) -> Self {
        self.panic_on_create = true;
        self
    }

    /// Copying the script into a container never completes
    pub fn hanging_write(mut self) -> Self {
        self.hang_writes = true;
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn created(&self) -> usize {
        self.state.lock().next_id
    }

    pub fn alive(&self) -> usize {
        self.state.lock().containers.len()
    }

    pub fn peak_alive(&self) -> usize {
        self.state.lock().peak_alive
    }

    pub fn kills(&self) -> usize {
        self.state.lock().kills
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.state.lock().specs.clone()
    }

    /// Removal count for every container ever created
    pub fn removals(&self) -> Vec<usize> {
        let state = self.state.lock();
        (0..state.next_id)
            .map(|n| state.removals.get(&container_id(n)).copied().unwrap_or(0))
            .collect()
    }

    /// Every created container was removed exactly once
    pub fn all_destroyed_once(&self) -> bool {
        self.alive() == 0 && self.removals().iter().all(|&n| n == 1)
    }
}

/// Route library logs to the test harness; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn container_id(n: usize) -> String {
    format!("fake{:060}", n)
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn ensure_image(&self, _image: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError> {
        if self.fail_create {
            return Err(EngineError::Unavailable("fake daemon is down".into()));
        }
        if self.panic_on_create {
            panic!("fake engine bug");
        }
        let mut state = self.state.lock();
        let id = container_id(state.next_id);
        state.next_id += 1;
        state.specs.push(spec.clone());
        state.containers.insert(id.clone(), Container::default());
        state.peak_alive = state.peak_alive.max(state.containers.len());
        Ok(ContainerId::new(id))
    }

    async fn write_file(
        &self,
        id: &ContainerId,
        path: &str,
        contents: &[u8],
    ) -> Result<(), EngineError> {
        if self.hang_writes {
            std::future::pending::<()>().await;
        }
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(id.as_str())
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        container.files.insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn exec(
        &self,
        id: &ContainerId,
        command: &[String],
        stdin: &[u8],
        max_output_bytes: usize,
    ) -> Result<ExecOutput, EngineError> {
        let (source, killed) = {
            let state = self.state.lock();
            let container = state
                .containers
                .get(id.as_str())
                .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
            let script = command
                .last()
                .and_then(|path| container.files.get(path))
                .cloned()
                .unwrap_or_default();
            (
                String::from_utf8_lossy(&script).into_owned(),
                container.killed.clone(),
            )
        };

        let killed_output = ExecOutput {
            exit_code: Some(137),
            ..Default::default()
        };
        match (self.program)(&source, stdin) {
            GuestRun::Exit {
                stdout,
                stderr,
                code,
            } => {
                tokio::select! {
                    _ = killed.cancelled() => return Ok(killed_output),
                    _ = tokio::time::sleep(self.exec_delay) => {}
                }
                let mut stdout = stdout.into_bytes();
                let stdout_truncated = stdout.len() > max_output_bytes;
                stdout.truncate(max_output_bytes);
                Ok(ExecOutput {
                    stdout,
                    stderr: stderr.into_bytes(),
                    exit_code: Some(code),
                    stdout_truncated,
                    stderr_truncated: false,
                })
            }
            GuestRun::Hang => {
                killed.cancelled().await;
                Ok(killed_output)
            }
            GuestRun::MemoryHog(bytes) => {
                if let Some(container) = self.state.lock().containers.get_mut(id.as_str()) {
                    container.memory_bytes = bytes;
                }
                killed.cancelled().await;
                Ok(killed_output)
            }
            GuestRun::OomKill => Ok(killed_output),
        }
    }

    async fn stats(&self, id: &ContainerId) -> Result<ResourceStats, EngineError> {
        let state = self.state.lock();
        let container = state
            .containers
            .get(id.as_str())
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        Ok(ResourceStats {
            cpu_percent: 12.5,
            memory_bytes: container.memory_bytes.max(8 * 1024 * 1024),
            pids: 1,
            io_ops: Some(3),
        })
    }

    async fn kill(&self, id: &ContainerId) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.kills += 1;
        if let Some(container) = state.containers.get(id.as_str()) {
            container.killed.cancel();
        }
        Ok(())
    }

    async fn remove(&self, id: &ContainerId) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if let Some(container) = state.containers.remove(id.as_str()) {
            container.killed.cancel();
        }
        *state.removals.entry(id.as_str().to_string()).or_insert(0) += 1;
        Ok(())
    }
}

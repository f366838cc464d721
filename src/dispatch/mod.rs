//! Command dispatch to hypervisor agents.
//!
//! A dispatched command is a control string that addresses one or more hosts
//! plus a shell command line for the agent to run, optionally followed by a
//! heredoc payload:
//!
//! ```text
//! control: select=group-zone-1:3,4 cpu=2 memory=2097152 disk=41943040 network=0
//! command: /opt/stratus/scripts/backend/launch_vm.sh '12' '1' 'linux'<<EOF
//! eyJ1c2VyZGF0YSI6IiJ9
//! EOF
//! ```
//!
//! How the pair travels to the agents is up to the [`HyperExecutor`].

mod group;
mod http;
mod shell;

pub use group::{format_group, GroupKind};
pub use http::HttpExecutor;
pub use shell::ShellExecutor;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::api::metrics;
use crate::config::{DispatchConfig, ExecutorType};

/// Resource requirements appended to `inter=` and `select=` controls so the
/// transport can pick a host with room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Resources {
    pub cpu: i64,
    /// KiB
    pub memory: i64,
    /// KiB
    pub disk: i64,
}

impl Resources {
    /// Build from instance sizing (memory in MiB, disk in GiB)
    pub fn for_instance(cpu: i64, memory_mib: i64, disk_gib: i64) -> Self {
        Self {
            cpu,
            memory: memory_mib.saturating_mul(1024),
            disk: disk_gib.saturating_mul(1024 * 1024),
        }
    }
}

/// Addressing directive telling the transport which host(s) receive a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// One specific host. A negative host id leaves the choice to the transport.
    Inter {
        hyper: i64,
        resources: Option<Resources>,
    },
    /// Any one host of a group
    Select {
        group: String,
        resources: Option<Resources>,
    },
    /// Every host of a group
    ToAll { group: String },
}

impl Control {
    pub fn inter(hyper: i64) -> Self {
        Control::Inter {
            hyper,
            resources: None,
        }
    }

    pub fn select(group: impl Into<String>) -> Self {
        Control::Select {
            group: group.into(),
            resources: None,
        }
    }

    pub fn to_all(group: impl Into<String>) -> Self {
        Control::ToAll {
            group: group.into(),
        }
    }

    pub fn with_resources(self, res: Resources) -> Self {
        match self {
            Control::Inter { hyper, .. } => Control::Inter {
                hyper,
                resources: Some(res),
            },
            Control::Select { group, .. } => Control::Select {
                group,
                resources: Some(res),
            },
            other => other,
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resources = match self {
            Control::Inter { hyper, resources } => {
                if *hyper >= 0 {
                    write!(f, "inter={}", hyper)?;
                } else {
                    f.write_str("inter=")?;
                }
                resources
            }
            Control::Select { group, resources } => {
                write!(f, "select={}", group)?;
                resources
            }
            Control::ToAll { group } => return write!(f, "toall={}", group),
        };
        if let Some(r) = resources {
            write!(
                f,
                " cpu={} memory={} disk={} network=0",
                r.cpu, r.memory, r.disk
            )?;
        }
        Ok(())
    }
}

/// A backend script invocation with single-quoted arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    script: String,
    args: Vec<String>,
    payload: Option<String>,
}

impl Command {
    /// `script` is the file stem under the scripts directory, e.g. `launch_vm`
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            args: Vec::new(),
            payload: None,
        }
    }

    pub fn arg(mut self, value: impl fmt::Display) -> Self {
        self.args.push(value.to_string());
        self
    }

    /// Attach a payload delivered on the script's stdin
    pub fn heredoc(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    /// Script path and arguments, without the payload. Safe to log.
    pub fn command_line(&self, scripts_dir: &str) -> String {
        let mut line = format!("{}/{}.sh", scripts_dir.trim_end_matches('/'), self.script);
        for arg in &self.args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        line
    }

    /// Full command text handed to the transport
    pub fn render(&self, scripts_dir: &str) -> String {
        let line = self.command_line(scripts_dir);
        match &self.payload {
            Some(payload) => format!("{}<<EOF\n{}\nEOF", line, payload),
            None => line,
        }
    }
}

/// Wrap a value in single quotes, escaping embedded quotes as `'\''`
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Transport delivering rendered commands to hypervisor agents
#[async_trait]
pub trait HyperExecutor: Send + Sync {
    fn name(&self) -> &'static str;
    async fn is_available(&self) -> bool;
    async fn execute(&self, control: &str, command: &str) -> Result<()>;
}

/// Executor used when no transport is configured. Commands are logged and dropped.
pub struct NoopExecutor;

#[async_trait]
impl HyperExecutor for NoopExecutor {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, control: &str, command: &str) -> Result<()> {
        let first_line = command.lines().next().unwrap_or_default();
        tracing::warn!(control, command = first_line, "No dispatch transport configured, dropping command");
        Ok(())
    }
}

/// Executor that keeps every call in memory instead of sending it
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<(String, String)>>,
    fail_script: Mutex<Option<String>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded `(control, command)` pairs in dispatch order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    /// Recorded calls whose command runs `script`
    pub fn calls_for(&self, script: &str) -> Vec<(String, String)> {
        let needle = format!("/{}.sh", script);
        self.calls()
            .into_iter()
            .filter(|(_, command)| command.contains(&needle))
            .collect()
    }

    /// Make every later call of `script` fail
    pub fn fail_on(&self, script: &str) {
        *self.fail_script.lock() = Some(format!("/{}.sh", script));
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl HyperExecutor for RecordingExecutor {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, control: &str, command: &str) -> Result<()> {
        self.calls
            .lock()
            .push((control.to_string(), command.to_string()));
        if let Some(script) = self.fail_script.lock().as_deref() {
            if command.contains(script) {
                anyhow::bail!("agent rejected {}", script);
            }
        }
        Ok(())
    }
}

/// Renders commands against the scripts directory and hands them to an executor
#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn HyperExecutor>,
    scripts_dir: String,
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn HyperExecutor>, scripts_dir: impl Into<String>) -> Self {
        Self {
            executor,
            scripts_dir: scripts_dir.into(),
        }
    }

    pub fn executor(&self) -> &Arc<dyn HyperExecutor> {
        &self.executor
    }

    pub async fn execute(&self, control: &Control, command: &Command) -> Result<()> {
        let control_text = control.to_string();
        let summary = command.command_line(&self.scripts_dir);
        tracing::debug!(control = %control_text, command = %summary, "Dispatching hyper command");

        let result = self
            .executor
            .execute(&control_text, &command.render(&self.scripts_dir))
            .await;

        match &result {
            Ok(()) => metrics::record_hyper_command(command.script(), true),
            Err(e) => {
                metrics::record_hyper_command(command.script(), false);
                tracing::error!(
                    control = %control_text,
                    script = command.script(),
                    error = %e,
                    "Hyper command failed"
                );
            }
        }
        result
    }

    /// Run queued commands one after another, logging failures instead of
    /// stopping at the first one. Returns how many failed.
    pub async fn execute_all(&self, batch: Vec<(Control, Command)>) -> usize {
        let mut failed = 0;
        for (control, command) in batch {
            if self.execute(&control, &command).await.is_err() {
                failed += 1;
            }
        }
        failed
    }
}

pub async fn create_executor(config: &DispatchConfig) -> Arc<dyn HyperExecutor> {
    match config.executor {
        ExecutorType::Shell => {
            let shell = ShellExecutor::new(config.client_path.clone(), config.timeout_secs);
            if shell.is_available().await {
                tracing::info!(client = %config.client_path.display(), "Using shell dispatch executor");
                Arc::new(shell)
            } else {
                tracing::warn!(
                    "Dispatch client {} not found. Hypervisor commands will be dropped.",
                    config.client_path.display()
                );
                Arc::new(NoopExecutor)
            }
        }
        ExecutorType::Http => match &config.endpoint {
            Some(endpoint) => match HttpExecutor::new(endpoint, config.timeout_secs) {
                Ok(http) => {
                    tracing::info!(endpoint = %endpoint, "Using http dispatch executor");
                    Arc::new(http)
                }
                Err(e) => {
                    tracing::warn!("Failed to build http dispatch executor: {}. Hypervisor commands will be dropped.", e);
                    Arc::new(NoopExecutor)
                }
            },
            None => {
                tracing::warn!("dispatch.endpoint is not set. Hypervisor commands will be dropped.");
                Arc::new(NoopExecutor)
            }
        },
        ExecutorType::Noop => Arc::new(NoopExecutor),
    }
}

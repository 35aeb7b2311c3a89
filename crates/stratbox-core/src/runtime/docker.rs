//! Docker CLI engine
//!
//! Drives `docker` (or a CLI-compatible engine such as `podman`) through
//! `tokio::process::Command`. Every spawned client is `kill_on_drop`, so a
//! cancelled future never leaves a stray CLI process behind.

use super::engine::{
    ContainerEngine, ContainerId, ContainerSpec, EngineError, ExecOutput, ResourceStats,
};
use crate::config::RuntimeConfig;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

static IMAGE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._/-]*(:[a-zA-Z0-9._-]+)?(@sha256:[a-f0-9]{64})?$").unwrap()
});

const MAX_IMAGE_NAME_LEN: usize = 256;

/// Container engine backed by the docker CLI
#[derive(Debug, Clone)]
pub struct DockerEngine {
    binary: String,
    command_timeout: Duration,
    pull_missing_image: bool,
    cgroup_root: PathBuf,
}

impl DockerEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            command_timeout: Duration::from_secs(30),
            pull_missing_image: false,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            command_timeout: config.command_timeout,
            pull_missing_image: config.pull_missing_image,
            ..Self::new(config.engine_binary.clone())
        }
    }

    /// Override where cgroup v2 accounting files are read from
    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn describe(&self, args: &[&str]) -> String {
        match args.first() {
            Some(sub) => format!("{} {}", self.binary, sub),
            None => self.binary.clone(),
        }
    }

    fn spawn_error(&self, err: std::io::Error) -> EngineError {
        if err.kind() == std::io::ErrorKind::NotFound {
            EngineError::Unavailable(format!("'{}' is not installed", self.binary))
        } else {
            err.into()
        }
    }

    /// Run a CLI command to completion under the command timeout
    async fn run(&self, args: &[&str]) -> Result<Output, EngineError> {
        let command = self.describe(args);
        debug!(command = %command, "Running engine command");
        match tokio::time::timeout(self.command_timeout, self.command(args).output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(self.spawn_error(e)),
            Err(_) => Err(EngineError::Timeout(command)),
        }
    }

    /// Run a CLI command and return its trimmed stdout, failing on a non-zero exit
    async fn run_checked(&self, args: &[&str]) -> Result<String, EngineError> {
        let output = self.run(args).await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_failure(self.describe(args), stderr))
    }

    async fn read_io_ops(&self, id: &ContainerId) -> Option<u64> {
        let candidates = [
            self.cgroup_root
                .join("system.slice")
                .join(format!("docker-{}.scope", id.as_str()))
                .join("io.stat"),
            self.cgroup_root.join("docker").join(id.as_str()).join("io.stat"),
        ];
        for path in candidates {
            if let Ok(contents) = tokio::fs::read_to_string(&path).await {
                return Some(parse_io_stat(&contents));
            }
        }
        None
    }
}

impl Default for DockerEngine {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<(), EngineError> {
        match self
            .run_checked(&["version", "--format", "{{.Server.Version}}"])
            .await
        {
            Ok(version) => {
                debug!(version = %version, "Engine reachable");
                Ok(())
            }
            Err(EngineError::CommandFailed { message, .. }) => {
                Err(EngineError::Unavailable(message))
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        validate_image_name(image)?;
        match self
            .run_checked(&["image", "inspect", "--format", "{{.Id}}", image])
            .await
        {
            Ok(_) => Ok(()),
            Err(EngineError::NotFound(_)) | Err(EngineError::CommandFailed { .. })
                if self.pull_missing_image =>
            {
                warn!(image, "Image missing locally, pulling");
                self.run_checked(&["pull", "--quiet", image]).await?;
                Ok(())
            }
            Err(EngineError::CommandFailed { .. }) => {
                Err(EngineError::NotFound(format!("image '{}'", image)))
            }
            Err(e) => Err(e),
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError> {
        validate_image_name(&spec.image)?;
        let args = build_run_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.run_checked(&args).await?;
        let id = stdout
            .lines()
            .last()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .ok_or_else(|| EngineError::Parse("`run` printed no container id".to_string()))?;
        Ok(ContainerId::new(id))
    }

    async fn write_file(
        &self,
        id: &ContainerId,
        path: &str,
        contents: &[u8],
    ) -> Result<(), EngineError> {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat > \"$1\"".to_string(),
            "sh".to_string(),
            path.to_string(),
        ];
        let output = self.exec(id, &command, contents, 4096).await?;
        if output.exit_code == Some(0) {
            Ok(())
        } else {
            Err(EngineError::command_failed(
                format!("write {}", path),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn exec(
        &self,
        id: &ContainerId,
        command: &[String],
        stdin: &[u8],
        max_output_bytes: usize,
    ) -> Result<ExecOutput, EngineError> {
        let mut cmd = self.command(["exec", "-i", id.as_str()]);
        cmd.args(command).stdin(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        let mut child_stdin = child.stdin.take();
        let child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();

        let feed = async {
            if let Some(mut pipe) = child_stdin.take() {
                // The guest may exit without reading its input.
                if let Err(e) = pipe.write_all(stdin).await {
                    debug!(error = %e, "Guest stdin closed early");
                }
                let _ = pipe.shutdown().await;
            }
        };
        let ((), stdout, stderr) = tokio::join!(
            feed,
            read_optional(child_stdout, max_output_bytes),
            read_optional(child_stderr, max_output_bytes),
        );
        let (stdout, stdout_truncated) = stdout?;
        let (stderr, stderr_truncated) = stderr?;
        let status = child.wait().await?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: status.code(),
            stdout_truncated,
            stderr_truncated,
        })
    }

    async fn stats(&self, id: &ContainerId) -> Result<ResourceStats, EngineError> {
        let line = self
            .run_checked(&["stats", "--no-stream", "--format", "{{json .}}", id.as_str()])
            .await?;
        let mut stats = parse_stats_line(&line)?;
        stats.io_ops = self.read_io_ops(id).await;
        Ok(stats)
    }

    async fn kill(&self, id: &ContainerId) -> Result<(), EngineError> {
        match self
            .run_checked(&["kill", "--signal", "KILL", id.as_str()])
            .await
        {
            Ok(_) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(EngineError::CommandFailed { message, .. }) if message.contains("is not running") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, id: &ContainerId) -> Result<(), EngineError> {
        match self.run_checked(&["rm", "--force", "--volumes", id.as_str()]).await {
            Ok(_) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Check an image reference before it is passed to the CLI
pub fn validate_image_name(image: &str) -> Result<(), EngineError> {
    if image.is_empty() || image.len() > MAX_IMAGE_NAME_LEN || !IMAGE_NAME.is_match(image) {
        return Err(EngineError::command_failed(
            "validate image",
            format!("invalid image reference '{}'", image),
        ));
    }
    Ok(())
}

/// Arguments for `docker run` creating an idle, locked-down container
pub fn build_run_args(spec: &ContainerSpec) -> Vec<String> {
    let c = &spec.constraints;
    let mut args: Vec<String> = vec![
        "run".into(),
        "--detach".into(),
        "--name".into(),
        spec.name.clone(),
        "--network".into(),
        "none".into(),
        "--read-only".into(),
        "--tmpfs".into(),
        format!(
            "{}:rw,noexec,nosuid,nodev,size={}",
            spec.scratch_dir, c.scratch_bytes
        ),
        "--workdir".into(),
        spec.scratch_dir.clone(),
        "--cap-drop".into(),
        "ALL".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--user".into(),
        c.user.clone(),
        "--memory".into(),
        c.memory_bytes.to_string(),
        "--memory-swap".into(),
        c.memory_bytes.to_string(),
        "--cpus".into(),
        format!("{:.2}", c.cpu_fraction),
        "--pids-limit".into(),
        c.max_processes.to_string(),
        "--ulimit".into(),
        format!("nofile={0}:{0}", c.max_open_files),
        "--env".into(),
        "PYTHONDONTWRITEBYTECODE=1".into(),
        "--env".into(),
        "PYTHONUNBUFFERED=1".into(),
        "--env".into(),
        format!("HOME={}", spec.scratch_dir),
    ];
    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{}={}", key, value));
    }
    args.extend([
        "--entrypoint".into(),
        "sleep".into(),
        spec.image.clone(),
        "infinity".into(),
    ]);
    args
}

#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    #[serde(rename = "MemUsage")]
    mem_usage: String,
    #[serde(rename = "PIDs", default)]
    pids: String,
}

/// Parse one `docker stats --format '{{json .}}'` line
pub fn parse_stats_line(line: &str) -> Result<ResourceStats, EngineError> {
    let raw: StatsLine = serde_json::from_str(line.trim())
        .map_err(|e| EngineError::Parse(format!("stats line: {}", e)))?;

    let cpu_percent = raw
        .cpu_perc
        .trim()
        .trim_end_matches('%')
        .parse::<f64>()
        .map_err(|_| EngineError::Parse(format!("cpu '{}'", raw.cpu_perc)))?;
    let used = raw.mem_usage.split('/').next().unwrap_or_default();
    let memory_bytes = parse_size(used)
        .ok_or_else(|| EngineError::Parse(format!("memory '{}'", raw.mem_usage)))?;
    let pids = raw.pids.trim().parse().unwrap_or(0);

    Ok(ResourceStats {
        cpu_percent,
        memory_bytes,
        pids,
        io_ops: None,
    })
}

/// Parse a human size as printed by the docker CLI (`12.5MiB`, `3kB`, `0B`)
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}

/// Sum read and write operations across devices in a cgroup v2 `io.stat`
pub fn parse_io_stat(contents: &str) -> u64 {
    contents
        .split_whitespace()
        .filter_map(|field| {
            let (key, value) = field.split_once('=')?;
            matches!(key, "rios" | "wios").then(|| value.parse::<u64>().ok())?
        })
        .sum()
}

fn classify_failure(command: String, stderr: String) -> EngineError {
    if stderr.contains("Cannot connect to the Docker daemon")
        || stderr.contains("Is the docker daemon running")
    {
        EngineError::Unavailable(stderr)
    } else if stderr.contains("No such container")
        || stderr.contains("No such image")
        || stderr.contains("no such container")
    {
        EngineError::NotFound(stderr)
    } else {
        EngineError::command_failed(command, stderr)
    }
}

async fn read_optional<R: AsyncRead + Unpin>(
    reader: Option<R>,
    limit: usize,
) -> Result<(Vec<u8>, bool), EngineError> {
    match reader {
        Some(reader) => Ok(read_capped(reader, limit).await?),
        None => Ok((Vec::new(), false)),
    }
}

/// Read to EOF keeping at most `limit` bytes
///
/// The remainder is drained so the writer never blocks on a full pipe.
pub async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
) -> std::io::Result<(Vec<u8>, bool)> {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }
    Ok((kept, truncated))
}

//! Run an external program to completion and capture its output.

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use metrics::histogram;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
}

pub fn command(program: &str, args: &[&str], dir: Option<&Path>, envs: &[(&str, String)]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
    if let Some(d) = dir {
        cmd.current_dir(d);
    }
    for (k, v) in envs {
        cmd.env(k, v);
    }
    cmd
}

/// Non-zero exit is an error carrying both output streams.
pub async fn run(program: &str, args: &[&str], dir: Option<&Path>, envs: &[(&str, String)]) -> Result<CmdOutput> {
    let started = Instant::now();
    let line = format!("{program} {}", args.join(" "));
    let out = command(program, args, dir, envs)
        .output()
        .await
        .with_context(|| format!("spawning `{line}`"))?;
    histogram!("ops_cmd_ms", started.elapsed().as_secs_f64() * 1000.0);
    let stdout = String::from_utf8_lossy(&out.stdout).trim_end().to_string();
    let stderr = String::from_utf8_lossy(&out.stderr).trim_end().to_string();
    if !out.status.success() {
        bail!("`{line}` failed ({}): {stdout} ;;; {stderr}", out.status);
    }
    debug!(cmd = %line, took_ms = %started.elapsed().as_millis(), "ops: command ok");
    Ok(CmdOutput { stdout, stderr })
}

//! Process execution for rendered actions.

use crate::config::RunnerConfig;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use workflow::{ActionOutput, ActionRunner, Interpreter, RenderedAction};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long to wait for output after the action's processes were killed.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Runs actions through a shell or PowerShell with a hard timeout.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    powershell: String,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default())
    }
}

impl ShellRunner {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            powershell: config.powershell.clone(),
            working_dir: config.working_dir.as_deref().map(crate::paths::expand),
            env: config.env.clone(),
        }
    }

    /// Build the process for an action without starting it.
    fn command(&self, action: &RenderedAction) -> Command {
        let mut cmd = match action.interpreter {
            Interpreter::Bash | Interpreter::AzureCli => {
                let mut cmd = Command::new(&self.shell);
                cmd.arg("-c").arg(&action.command);
                cmd
            }
            Interpreter::BashScript => {
                let mut cmd = Command::new(&self.shell);
                cmd.arg("-c")
                    .arg(format!("set -euo pipefail\n{}", action.command));
                cmd
            }
            Interpreter::PowershellLocal
            | Interpreter::PowershellRemote
            | Interpreter::PowershellVmCommand => {
                let mut cmd = Command::new(&self.powershell);
                cmd.args(["-NoLogo", "-NoProfile", "-NonInteractive", "-Command"])
                    .arg(&action.command);
                cmd
            }
        };

        cmd.envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }
}

enum Stream {
    Stdout,
    Stderr,
}

fn drain<R: Read + Send + 'static>(source: Option<R>, stream: Stream, tx: Sender<(Stream, String)>) {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut buf);
        }
        let _ = tx.send((stream, String::from_utf8_lossy(&buf).into_owned()));
    });
}

/// Output gathered from the drain threads.
struct Captured {
    rx: Receiver<(Stream, String)>,
    stdout: String,
    stderr: String,
}

impl Captured {
    /// Wait for both streams to close, giving up at `until`.
    ///
    /// Returns `false` if a stream is still open at the deadline, which means
    /// something the action started still holds the pipe.
    fn collect(&mut self, until: Instant) -> bool {
        loop {
            let left = until.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(left) {
                Ok((Stream::Stdout, text)) => self.stdout = text,
                Ok((Stream::Stderr, text)) => self.stderr = text,
                Err(RecvTimeoutError::Disconnected) => return true,
                Err(RecvTimeoutError::Timeout) => return false,
            }
        }
    }
}

/// Kill the child and everything it started.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: the child leads its own process group; a negative pid signals that group
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
}

impl ActionRunner for ShellRunner {
    fn run(&self, action: &RenderedAction, timeout: Duration) -> Result<ActionOutput> {
        log::debug!("Running ({}): {}", action.interpreter, action.command);
        let started = Instant::now();
        let deadline = started + timeout;
        let mut child = self
            .command(action)
            .spawn()
            .with_context(|| format!("Failed to execute {} action", action.interpreter))?;

        let (tx, rx) = mpsc::channel();
        drain(child.stdout.take(), Stream::Stdout, tx.clone());
        drain(child.stderr.take(), Stream::Stderr, tx);
        let mut captured = Captured {
            rx,
            stdout: String::new(),
            stderr: String::new(),
        };

        let mut status = loop {
            if let Some(status) = child.try_wait().context("Failed to wait for action")? {
                break Some(status);
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!(
                    "Action exceeded its {}s timeout, killing it",
                    timeout.as_secs()
                );
                kill_tree(&mut child);
                let _ = child.wait();
                break None;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        };

        // A background process can keep the output pipes open after the shell exits.
        if status.is_some() && !captured.collect(deadline) {
            log::warn!(
                "Action left processes running past its {}s timeout, killing them",
                timeout.as_secs()
            );
            kill_tree(&mut child);
            status = None;
        }
        if !captured.collect(Instant::now() + DRAIN_GRACE) {
            log::debug!("Output of a killed action is still open, dropping the rest");
        }
        let duration = started.elapsed();

        let output = match status {
            Some(status) => ActionOutput {
                exit_code: status.code(),
                ..ActionOutput::default()
            },
            None => ActionOutput::timeout(duration),
        };
        Ok(output
            .with_stdout(captured.stdout)
            .with_stderr(captured.stderr)
            .with_duration(duration))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn bash(command: &str) -> RenderedAction {
        RenderedAction::bash(command)
    }

    #[test]
    fn test_captures_output_and_exit_code() {
        let out = ShellRunner::default()
            .run(&bash("echo created; echo warning >&2; exit 3"), Duration::from_secs(10))
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "created");
        assert_eq!(out.stderr.trim(), "warning");
        assert!(!out.timed_out);
        assert!(!out.success());
    }

    #[test]
    fn test_success() {
        let out = ShellRunner::default()
            .run(&bash("true"), Duration::from_secs(10))
            .unwrap();
        assert!(out.success());
    }

    #[test]
    fn test_timeout_kills_the_action() {
        let started = Instant::now();
        let out = ShellRunner::default()
            .run(&bash("sleep 30"), Duration::from_millis(300))
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_timeout_covers_background_processes() {
        let started = Instant::now();
        let out = ShellRunner::default()
            .run(&bash("sleep 6 & echo started"), Duration::from_millis(300))
            .unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(out.stdout.trim(), "started");
    }

    #[test]
    fn test_bash_script_stops_at_first_failure() {
        let action = RenderedAction::new(Interpreter::BashScript, "false\necho reached");
        let out = ShellRunner::default()
            .run(&action, Duration::from_secs(10))
            .unwrap();
        assert_eq!(out.exit_code, Some(1));
        assert!(!out.stdout.contains("reached"));
    }

    #[test]
    fn test_env_and_working_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = RunnerConfig {
            working_dir: Some(dir.path().display().to_string()),
            env: BTreeMap::from([("CAPSTAN_TEST_VALUE".to_string(), "42".to_string())]),
            ..RunnerConfig::default()
        };
        let out = ShellRunner::from_config(&config)
            .run(&bash("echo $CAPSTAN_TEST_VALUE; pwd"), Duration::from_secs(10))
            .unwrap();
        let lines: Vec<&str> = out.stdout.lines().collect();
        assert_eq!(lines[0], "42");
        assert!(lines[1].ends_with(&*dir.path().file_name().unwrap().to_string_lossy()));
    }

    #[test]
    fn test_missing_interpreter_is_a_spawn_error() {
        let config = RunnerConfig {
            shell: "/nonexistent/capstan-shell".to_string(),
            ..RunnerConfig::default()
        };
        assert!(
            ShellRunner::from_config(&config)
                .run(&bash("true"), Duration::from_secs(1))
                .is_err()
        );
    }
}

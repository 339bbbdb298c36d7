//! Assistant subprocess supervision.
//!
//! The assistant runs in its own process group so that stopping it also
//! reaches any children it spawned. A monitor task owns the `Child`: it either
//! observes an unexpected exit, or, once cancelled, performs the graceful
//! SIGTERM → wait → SIGKILL sequence.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::AssistantError;
use crate::config::AssistantConfig;

/// Handle to a spawned assistant process.
///
/// Dropping the handle without calling [`stop`](Self::stop) leaves the monitor
/// running; the child is still killed when the monitor's `Child` is dropped.
pub struct ProcessHandle {
    pid: Option<u32>,
    work_dir: PathBuf,
    host: String,
    port: u16,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
    monitor: JoinHandle<()>,
}

impl ProcessHandle {
    /// Spawn the assistant described by `config`.
    ///
    /// `on_exit` runs on the monitor task if the process exits on its own
    /// (not when [`stop`](Self::stop) terminates it).
    pub fn spawn<F>(
        config: &AssistantConfig,
        grace: Duration,
        on_exit: F,
    ) -> Result<Self, AssistantError>
    where
        F: FnOnce(Option<i32>) + Send + 'static,
    {
        let work_dir = config
            .work_dir
            .clone()
            .ok_or_else(|| AssistantError::SpawnFailed("no working directory".to_string()))?;

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .args(["--hostname", &config.host, "--port", &config.port.to_string()])
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        // SAFETY: pre_exec runs in the forked child before exec. PR_SET_PDEATHSIG
        // makes the child receive SIGTERM if the bridge dies without stopping it.
        // No shared mutable state is touched.
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AssistantError::SpawnFailed(format!("{}: {}", config.command, e)))?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr");
        }

        info!(
            pid = ?pid,
            command = %config.command,
            work_dir = %work_dir.display(),
            port = config.port,
            "Assistant process spawned"
        );

        let alive = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let monitor = spawn_monitor(child, pid, grace, alive.clone(), cancel.clone(), on_exit);

        Ok(Self {
            pid,
            work_dir,
            host: config.host.clone(),
            port: config.port,
            alive,
            cancel,
            monitor,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Terminate the process group and wait for the monitor to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.monitor.await {
            warn!(error = %e, "Assistant monitor task failed");
        }
        self.alive.store(false, Ordering::SeqCst);
    }
}

fn spawn_monitor<F>(
    mut child: Child,
    pid: Option<u32>,
    grace: Duration,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
    on_exit: F,
) -> JoinHandle<()>
where
    F: FnOnce(Option<i32>) + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            result = child.wait() => {
                alive.store(false, Ordering::SeqCst);
                let code = match result {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!(pid = ?pid, error = %e, "Failed to wait on assistant process");
                        None
                    }
                };
                warn!(pid = ?pid, exit_code = ?code, "Assistant process exited");
                on_exit(code);
            }
            _ = cancel.cancelled() => {
                graceful_kill(&mut child, pid, grace).await;
                alive.store(false, Ordering::SeqCst);
            }
        }
    })
}

/// SIGTERM the process group, wait up to `grace`, then SIGKILL.
async fn graceful_kill(child: &mut Child, pid: Option<u32>, grace: Duration) {
    send_terminate(child, pid);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!(pid = ?pid, "Assistant process terminated"),
        Err(_) => {
            warn!(pid = ?pid, grace = ?grace, "Assistant ignored SIGTERM, killing");
            force_kill_group(pid);
            if let Err(e) = child.kill().await {
                warn!(pid = ?pid, error = %e, "Failed to kill assistant process");
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child, pid: Option<u32>) {
    match pid {
        Some(pid) => signal_group(pid, libc::SIGTERM),
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn force_kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        signal_group(pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn force_kill_group(_pid: Option<u32>) {}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid targets the process group created
    // for this child via process_group(0); it has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, signal, error = %err, "Failed to signal assistant process group");
        }
    }
}

fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "chatbridge::assistant::output", stream, "{}", line);
        }
    });
}

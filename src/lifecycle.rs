use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::daemon::{DaemonExit, DaemonLoop};
use crate::error::EchoNotesError;

/// File holding the decimal process id of the running daemon
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PidFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored pid. `Ok(None)` when there is no file.
    ///
    /// Content that isn't a positive integer is an error.
    pub fn read(&self) -> Result<Option<i32>, EchoNotesError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match contents.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid)),
            _ => Err(EchoNotesError::Lifecycle(format!(
                "PID file {} has invalid content '{}'",
                self.path.display(),
                contents.trim()
            ))),
        }
    }

    /// Record the current process as the daemon
    pub fn write_current(&self) -> Result<(), EchoNotesError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, std::process::id().to_string())?;
        Ok(())
    }

    /// Delete the file; a file that's already gone is not an error
    pub fn remove(&self) -> Result<(), EchoNotesError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Removes the PID file when dropped, provided it still names this process
struct PidFileGuard {
    pid_file: PidFile,
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let own_pid = std::process::id() as i32;
        if !matches!(self.pid_file.read(), Ok(Some(pid)) if pid == own_pid) {
            return;
        }
        if let Err(e) = self.pid_file.remove() {
            warn!(
                "Failed to remove PID file {}: {}",
                self.pid_file.path().display(),
                e
            );
        } else {
            debug!("Removed PID file {}", self.pid_file.path().display());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<i32>,
}

impl DaemonStatus {
    fn not_running() -> Self {
        DaemonStatus {
            running: false,
            pid: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No daemon to stop; nothing was signalled
    NotRunning,
    Stopped { pid: i32 },
    /// SIGTERM was sent but the process was still alive at the deadline
    TimedOut { pid: i32 },
}

impl StopOutcome {
    #[cfg(test)]
    pub fn stopped(&self) -> bool {
        matches!(self, StopOutcome::Stopped { .. })
    }
}

/// Paths the detached daemon's standard streams are redirected to
#[derive(Debug, Clone)]
pub struct DetachedStreams {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// Start, stop and inspect the daemon process through its PID file.
///
/// Other processes (the CLI, a dashboard) only ever see the daemon through
/// this file and the process table.
pub struct ProcessLifecycleManager {
    pid_file: PidFile,
    stop_timeout: Duration,
    stop_poll: Duration,
}

impl ProcessLifecycleManager {
    pub fn new(pid_file: PidFile, stop_timeout: Duration) -> Self {
        ProcessLifecycleManager {
            pid_file,
            stop_timeout,
            stop_poll: Duration::from_millis(250),
        }
    }

    #[cfg(test)]
    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }

    /// Report whether the daemon is running. A PID file naming a dead process
    /// (or holding garbage) is stale: it is deleted and the daemon reported
    /// as not running.
    pub fn status(&self) -> Result<DaemonStatus, EchoNotesError> {
        let pid = match self.pid_file.read() {
            Ok(Some(pid)) => pid,
            Ok(None) => return Ok(DaemonStatus::not_running()),
            Err(EchoNotesError::Lifecycle(msg)) => {
                warn!("{}. Removing it.", msg);
                self.pid_file.remove()?;
                return Ok(DaemonStatus::not_running());
            }
            Err(e) => return Err(e),
        };

        if probe_process(pid)? {
            debug!("Daemon process with PID {} is running", pid);
            Ok(DaemonStatus {
                running: true,
                pid: Some(pid),
            })
        } else {
            info!(
                "Daemon process with PID {} is not running (stale PID file), removing {}",
                pid,
                self.pid_file.path().display()
            );
            self.pid_file.remove()?;
            Ok(DaemonStatus::not_running())
        }
    }

    /// Ask the daemon to stop with SIGTERM and wait up to the stop timeout for
    /// it to exit. Never escalates to SIGKILL.
    pub fn stop(&self) -> Result<StopOutcome, EchoNotesError> {
        let pid = match self.pid_file.read() {
            Ok(Some(pid)) => pid,
            Ok(None) => return Ok(StopOutcome::NotRunning),
            Err(EchoNotesError::Lifecycle(msg)) => {
                warn!("{}. Removing it.", msg);
                self.pid_file.remove()?;
                return Ok(StopOutcome::NotRunning);
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = send_terminate(pid) {
            if e.raw_os_error() == Some(libc::ESRCH) {
                info!("Daemon process with PID {} already exited, removing stale PID file", pid);
                self.pid_file.remove()?;
                return Ok(StopOutcome::NotRunning);
            }
            return Err(EchoNotesError::Lifecycle(format!(
                "Failed to signal daemon process {}: {}",
                pid, e
            )));
        }
        info!("Sent termination signal to daemon process (PID: {})", pid);

        let deadline = Instant::now() + self.stop_timeout;
        loop {
            if !probe_process(pid)? {
                // The daemon removes its own PID file; clear it if it crashed on the way out
                if let Ok(Some(stored)) = self.pid_file.read() {
                    if stored == pid {
                        self.pid_file.remove()?;
                    }
                }
                info!("Daemon stopped successfully");
                return Ok(StopOutcome::Stopped { pid });
            }
            if Instant::now() >= deadline {
                warn!(
                    "Daemon (PID: {}) did not stop within {:?}, may need to be killed manually",
                    pid, self.stop_timeout
                );
                return Ok(StopOutcome::TimedOut { pid });
            }
            thread::sleep(self.stop_poll);
        }
    }

    /// Run the daemon, detached from the terminal when `detached` is set.
    ///
    /// `prepare` is called after detachment (so it may open log files and
    /// build HTTP clients in the final process) and returns the loop to run.
    /// The PID file is written once the process is final and removed when
    /// the loop returns.
    pub fn start<F>(
        &self,
        detached: Option<&DetachedStreams>,
        prepare: F,
    ) -> Result<DaemonExit, EchoNotesError>
    where
        F: FnOnce() -> Result<DaemonLoop, EchoNotesError>,
    {
        let status = self.status()?;
        if let (true, Some(pid)) = (status.running, status.pid) {
            return Err(EchoNotesError::AlreadyRunning(pid));
        }

        if let Some(streams) = detached {
            daemonize(streams)?;
        }

        self.pid_file.write_current()?;
        let _guard = PidFileGuard {
            pid_file: self.pid_file.clone(),
        };

        let daemon = prepare()?;
        info!("Daemon started with PID {}", std::process::id());

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| EchoNotesError::Error(format!("Failed to create runtime: {}", e)))?;
        rt.block_on(daemon.run_with_signals())
    }
}

/// Liveness check that refuses to guess where the platform can't tell.
/// A PID file is never treated as stale unless the probe says so.
fn probe_process(pid: i32) -> Result<bool, EchoNotesError> {
    is_process_alive(pid).map_err(|e| {
        EchoNotesError::Lifecycle(format!(
            "Cannot determine whether daemon process {} is running: {}",
            pid, e
        ))
    })
}

/// Whether a process with this pid exists (signal-zero probe)
#[cfg(unix)]
pub fn is_process_alive(pid: i32) -> io::Result<bool> {
    if pid <= 0 {
        // 0 and negative values address process groups, not a single process
        return Ok(false);
    }
    // SAFETY: signal 0 performs only the existence and permission check
    if unsafe { libc::kill(pid, 0) } == 0 {
        return Ok(true);
    }
    // EPERM means the process exists but belongs to someone else
    Ok(io::Error::last_os_error().raw_os_error() == Some(libc::EPERM))
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: i32) -> io::Result<bool> {
    Err(io::Error::new(
        ErrorKind::Unsupported,
        "process liveness checks are only supported on Unix",
    ))
}

#[cfg(unix)]
fn send_terminate(pid: i32) -> io::Result<()> {
    if pid <= 0 {
        return Err(io::Error::from_raw_os_error(libc::ESRCH));
    }
    // SAFETY: plain kill(2) on a positive pid
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: i32) -> io::Result<()> {
    Err(io::Error::new(
        ErrorKind::Unsupported,
        "stopping the daemon is only supported on Unix",
    ))
}

/// Detach from the controlling terminal with the classic double fork.
///
/// The log files are opened before forking so that failures are reported to
/// the invoking shell. The first parent exits 0 once the first fork succeeds.
#[cfg(unix)]
fn daemonize(streams: &DetachedStreams) -> Result<(), EchoNotesError> {
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    for path in [&streams.stdout, &streams.stderr] {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
    }
    let dev_null = fs::File::open("/dev/null")?;
    let stdout = OpenOptions::new().create(true).append(true).open(&streams.stdout)?;
    let stderr = OpenOptions::new().create(true).append(true).open(&streams.stderr)?;

    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    fork_and_exit_parent("first")?;

    // SAFETY: the child is single-threaded here; these calls have no memory-safety preconditions
    unsafe {
        if libc::chdir(c"/".as_ptr()) != 0 {
            return Err(os_error("chdir to /"));
        }
        if libc::setsid() == -1 {
            return Err(os_error("setsid"));
        }
        libc::umask(0o022);
    }

    fork_and_exit_parent("second")?;

    for (file, target) in [
        (dev_null.as_raw_fd(), libc::STDIN_FILENO),
        (stdout.as_raw_fd(), libc::STDOUT_FILENO),
        (stderr.as_raw_fd(), libc::STDERR_FILENO),
    ] {
        // SAFETY: both descriptors are open for the duration of the call
        if unsafe { libc::dup2(file, target) } == -1 {
            return Err(os_error("dup2"));
        }
    }

    Ok(())
}

#[cfg(unix)]
fn fork_and_exit_parent(which: &str) -> Result<(), EchoNotesError> {
    // SAFETY: called before any threads or runtimes are started
    match unsafe { libc::fork() } {
        -1 => Err(os_error(&format!("{} fork", which))),
        0 => Ok(()),
        // SAFETY: _exit skips atexit handlers and destructors, which belong to the child now
        _ => unsafe { libc::_exit(0) },
    }
}

#[cfg(unix)]
fn os_error(op: &str) -> EchoNotesError {
    EchoNotesError::Lifecycle(format!("{} failed: {}", op, io::Error::last_os_error()))
}

#[cfg(not(unix))]
fn daemonize(_streams: &DetachedStreams) -> Result<(), EchoNotesError> {
    Err(EchoNotesError::Lifecycle(
        "Detached mode is only supported on Unix; run in the foreground under a service manager"
            .to_string(),
    ))
}

//! Process lifecycle management for external tool processes
//!
//! Every filesystem and partition tool (`sfdisk`, `mkfs.*`, `e2fsck`,
//! `resize2fs`, ...) runs in its own process group and is tracked here, so that
//! a tool mutating storage never outlives the process that started it.
//!
//! # Guarantees
//! - Children are spawned as leaders of a new process group
//! - Children receive SIGTERM if the parent dies (`PR_SET_PDEATHSIG`)
//! - All live children are tracked in a registry
//! - On parent exit (Drop, or a signal while no queue runs) the registry sends
//!   SIGTERM to every group, waits out a grace period, then sends SIGKILL
//! - While a queue runs, the first SIGINT/SIGTERM/SIGHUP only cancels the
//!   queue; the running job finishes its writes first. A second signal
//!   terminates tools and exits.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();
static SIGNAL_ROUTER: OnceLock<SignalRouter> = OnceLock::new();

/// Registry tracking all spawned tool processes
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    /// Set once termination started, so signal handler and Drop do not race
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// Get or create the process-wide child registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    /// Register a new child process
    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        tracing::debug!("Registered tool process PID {}", pid);
    }

    /// Unregister a child process (called when it exits normally)
    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        tracing::debug!("Unregistered tool process PID {}", pid);
    }

    /// Number of tracked children
    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate all tracked child process groups.
    ///
    /// Sends SIGTERM first, waits up to `grace_period`, then SIGKILL.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            tracing::debug!("Cleanup already initiated, skipping");
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            tracing::debug!("No tool processes to terminate");
            return;
        }

        tracing::info!("Terminating {} tool process(es)...", self.pids.len());

        let pids_to_kill: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &pids_to_kill {
            if let Err(e) = kill_group(pid, Signal::SIGTERM) {
                tracing::warn!("Failed to send SIGTERM to process group {}: {}", pid, e);
                if let Err(e2) = send_signal(pid, Signal::SIGTERM) {
                    tracing::warn!("Failed to send SIGTERM to PID {}: {}", pid, e2);
                }
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if pids_to_kill.iter().all(|&pid| !is_process_alive(pid)) {
                tracing::info!("All tool processes terminated gracefully");
                self.pids.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in &pids_to_kill {
            if is_process_alive(pid) {
                tracing::warn!("Process group {} did not terminate, sending SIGKILL", pid);
                if let Err(e) = kill_group(pid, Signal::SIGKILL) {
                    tracing::error!("Failed to send SIGKILL to process group {}: {}", pid, e);
                    let _ = send_signal(pid, Signal::SIGKILL);
                }
            }
        }

        self.pids.clear();
        tracing::info!("Tool process cleanup complete");
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Send a signal to an entire process group.
///
/// The negative PID addresses the group, so helpers forked by the tool
/// receive the signal as well.
pub fn kill_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Check if a process is still alive (not dead or zombie)
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/<pid>/stat is the state; Z and X are not running
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }

    true
}

/// RAII guard that terminates all tool processes on drop.
///
/// The CLI holds one for the lifetime of a queue run.
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
    /// Create a new process guard attached to the global registry
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }

    /// Get the number of tracked children
    pub fn child_count(&self) -> usize {
        self.registry.lock().map(|r| r.count()).unwrap_or(0)
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        tracing::debug!("ProcessGuard dropped, initiating cleanup");
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(Duration::from_secs(5));
        }
    }
}

/// What the signal thread does with one received signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// A queue was asked to stop after its running job
    CancelQueue,
    /// Terminate tool processes and exit
    Exit,
}

/// Routes termination signals to the active queue's cancel flag.
#[derive(Debug, Default)]
pub struct SignalRouter {
    target: Mutex<Option<Arc<AtomicBool>>>,
    received: AtomicUsize,
}

impl SignalRouter {
    /// Process-wide router used by the signal thread
    pub fn global() -> &'static SignalRouter {
        SIGNAL_ROUTER.get_or_init(SignalRouter::default)
    }

    /// Route signals to `cancel` until the returned guard drops.
    pub fn register(&self, cancel: Arc<AtomicBool>) -> CancelRegistration<'_> {
        if let Ok(mut target) = self.target.lock() {
            *target = Some(cancel);
        }
        CancelRegistration { router: self }
    }

    /// Decide what to do with a received signal.
    ///
    /// The first signal during a run only sets the cancel flag; any further
    /// one, or a signal with no run active, asks for exit.
    pub fn route(&self) -> SignalAction {
        let count = self.received.fetch_add(1, Ordering::SeqCst) + 1;
        let target = self.target.lock().ok().and_then(|t| t.clone());
        match target {
            Some(cancel) if count == 1 => {
                cancel.store(true, Ordering::SeqCst);
                SignalAction::CancelQueue
            }
            _ => SignalAction::Exit,
        }
    }

    fn clear(&self) {
        if let Ok(mut target) = self.target.lock() {
            *target = None;
        }
        self.received.store(0, Ordering::SeqCst);
    }
}

/// Keeps a queue's cancel flag registered with a [`SignalRouter`]
pub struct CancelRegistration<'a> {
    router: &'a SignalRouter,
}

impl Drop for CancelRegistration<'_> {
    fn drop(&mut self) {
        self.router.clear();
    }
}

/// Install handlers for SIGINT, SIGTERM and SIGHUP. Call once at program start.
///
/// While a queue is registered with [`SignalRouter::global`], the first signal
/// cancels it between jobs. Otherwise tool processes are terminated and the
/// process exits.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    thread::spawn(move || {
        for sig in signals.forever() {
            let signal_name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "UNKNOWN",
            };

            match SignalRouter::global().route() {
                SignalAction::CancelQueue => {
                    tracing::warn!(
                        "Received {}, stopping after the running job; send it again to abort",
                        signal_name
                    );
                }
                SignalAction::Exit => {
                    tracing::warn!("Received {}, terminating tool processes", signal_name);
                    if let Ok(mut registry) = ChildRegistry::global().lock() {
                        registry.terminate_all(Duration::from_secs(3));
                    }
                    std::process::exit(128 + sig);
                }
            }
        }
    });

    Ok(())
}

/// Extension trait for `std::process::Command` to set up process groups
pub trait CommandProcessGroup {
    /// Run the command as the leader of its own process group, and have it
    /// receive SIGTERM when the parent dies.
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe syscalls (setpgid, prctl)
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}

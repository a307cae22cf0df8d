//! File-based advisory lock on a conversion host
//!
//! The lock is the mere existence of a file, created atomically with the
//! shell's noclobber option. The file holds the holder's process id so a
//! later caller can recover from a crashed holder.
//!
//! Stale-lock recovery is a heuristic: the recorded pid is checked in the
//! controller's process namespace. A reused pid makes a dead holder look
//! alive, so the caller waits. A holder running on another controller
//! machine usually looks dead and its lock is removed at once, so two
//! controllers sharing one conversion host can break each other's locks.

use async_io::Timer;
use command_executor::{Shell, shell_escape};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Exit code of the acquire one-liner when another holder has the lock
const HELD_EXIT_CODE: i32 = 17;

/// Named mutual exclusion on a remote host
#[derive(Clone)]
pub struct AdvisoryLock {
    shell: Arc<dyn Shell>,
    path: String,
    ceiling: Duration,
    interval: Duration,
    holder_pid: u32,
}

impl std::fmt::Debug for AdvisoryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisoryLock")
            .field("host", &self.shell.host())
            .field("path", &self.path)
            .field("ceiling", &self.ceiling)
            .finish()
    }
}

/// Outcome of one acquisition attempt
enum Attempt {
    Acquired,
    Held,
    Transient(String),
}

impl AdvisoryLock {
    /// Create a lock at `path` on the shell's host
    pub fn new(
        shell: Arc<dyn Shell>,
        path: impl Into<String>,
        ceiling: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            shell,
            path: path.into(),
            ceiling,
            interval,
            holder_pid: std::process::id(),
        }
    }

    /// Lock file path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run `body` while holding the lock
    ///
    /// `body` is not polled until the lock is acquired, so it runs at most
    /// once and never without the lock. The lock is released on every exit
    /// path once acquired; a release failure is logged and never replaces
    /// the body's own result.
    pub async fn with_lock<T, F>(&self, body: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.acquire().await?;
        let result = body.await;
        if let Err(e) = self.release().await {
            warn!(host = self.shell.host(), path = %self.path, error = %e, "failed to release lock");
        }
        result
    }

    async fn acquire(&self) -> Result<()> {
        let started = Instant::now();
        let mut recovered: Option<u32> = None;

        loop {
            match self.try_acquire().await? {
                Attempt::Acquired => {
                    debug!(host = self.shell.host(), path = %self.path, "lock acquired");
                    return Ok(());
                }
                Attempt::Held => {
                    if let Some(pid) = self.holder().await? {
                        if recovered != Some(pid) && !process_alive(pid) {
                            recovered = Some(pid);
                            if self.remove_stale(pid).await? {
                                info!(
                                    host = self.shell.host(),
                                    path = %self.path,
                                    pid,
                                    "removed lock left by a dead holder"
                                );
                                continue;
                            }
                        }
                    }
                    debug!(host = self.shell.host(), path = %self.path, "lock held, waiting");
                }
                Attempt::Transient(output) => {
                    warn!(host = self.shell.host(), path = %self.path, %output, "lock attempt failed, retrying");
                }
            }

            if started.elapsed() >= self.ceiling {
                return Err(Error::LockTimeout {
                    host: self.shell.host().to_string(),
                    path: self.path.clone(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            Timer::after(self.interval).await;
        }
    }

    async fn try_acquire(&self) -> Result<Attempt> {
        let path = shell_escape(&self.path);
        let script = format!(
            "( set -C; echo {pid} > {path} ) 2>/dev/null && exit 0; \
             if [ -e {path} ]; then exit {HELD_EXIT_CODE}; fi; exit 18",
            pid = self.holder_pid,
        );
        let result = self.shell.run(&script).await?;
        Ok(match result.code() {
            Some(0) => Attempt::Acquired,
            Some(HELD_EXIT_CODE) => Attempt::Held,
            _ => Attempt::Transient(result.output.trim().to_string()),
        })
    }

    /// Pid recorded in the lock file, if it holds one
    async fn holder(&self) -> Result<Option<u32>> {
        let script = format!("cat {} 2>/dev/null", shell_escape(&self.path));
        let result = self.shell.run(&script).await?;
        Ok(result.stdout.trim().parse::<u32>().ok().filter(|pid| *pid > 0))
    }

    /// Remove the lock file only if it still names `pid`
    async fn remove_stale(&self, pid: u32) -> Result<bool> {
        let path = shell_escape(&self.path);
        let script = format!(
            "[ \"$(cat {path} 2>/dev/null)\" = \"{pid}\" ] && rm -f {path}"
        );
        Ok(self.shell.status(&script).await? == Some(0))
    }

    async fn release(&self) -> Result<()> {
        let script = format!("rm -f {}", shell_escape(&self.path));
        self.shell.run_checked(&script).await?;
        debug!(host = self.shell.host(), path = %self.path, "lock released");
        Ok(())
    }
}

/// Whether a process with `pid` exists
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

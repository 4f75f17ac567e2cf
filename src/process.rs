//! Backend processes
//!
//! The proxy only needs three things from a backend: a way to start it, a way
//! to stop it, and the address it will listen on once it has booted.

use crate::address::BackendAddress;
use crate::config::{BackendConfig, BackendDefaults};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// A spawnable unit exposing a connectable address
pub trait BackendProcess: Send + Sync + fmt::Debug {
    /// Address the backend listens on once started. It may refuse
    /// connections for a while after `spawn` returns.
    fn address(&self) -> &BackendAddress;

    /// Begin starting the backend. Returns once the start has been
    /// initiated, not once the backend is ready.
    fn spawn(&self) -> anyhow::Result<()>;

    /// Request shutdown (best effort, safe to call more than once)
    fn terminate(&self) -> BoxFuture<'_, ()>;
}

/// Build the process for a configured backend
pub fn from_config(config: &BackendConfig, defaults: &BackendDefaults) -> Arc<dyn BackendProcess> {
    if config.is_external() {
        Arc::new(ExternalBackend::new(config.address.clone()))
    } else {
        Arc::new(LocalProcess::new(
            config.clone(),
            config.shutdown_grace_period(defaults),
        ))
    }
}

/// A backend running as a child process of the proxy
pub struct LocalProcess {
    config: BackendConfig,
    grace_period: Duration,
    child: Mutex<Option<Child>>,
}

impl LocalProcess {
    pub fn new(config: BackendConfig, grace_period: Duration) -> Self {
        Self {
            config,
            grace_period,
            child: Mutex::new(None),
        }
    }

    /// PID of the running child, if any
    pub fn pid(&self) -> Option<u32> {
        self.child.lock().as_ref().and_then(|c| c.id())
    }

    fn command(&self) -> anyhow::Result<Command> {
        let program = self
            .config
            .command
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Local backend requires 'command' field"))?;

        let mut cmd = Command::new(program);
        cmd.args(&self.config.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        // Tell the backend where to listen
        match &self.config.address {
            BackendAddress::Tcp(addr) => {
                cmd.env("PORT", addr.port().to_string());
            }
            BackendAddress::Unix(path) => {
                cmd.env("SOCKET", path);
            }
        }

        Ok(cmd)
    }
}

impl fmt::Debug for LocalProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalProcess")
            .field("command", &self.config.command)
            .field("address", &self.config.address)
            .field("pid", &self.pid())
            .finish()
    }
}

impl BackendProcess for LocalProcess {
    fn address(&self) -> &BackendAddress {
        &self.config.address
    }

    fn spawn(&self) -> anyhow::Result<()> {
        let mut cmd = self.command()?;

        if let BackendAddress::Unix(path) = &self.config.address {
            remove_stale_socket(path)?;
        }

        let child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!(
                "Failed to spawn '{}': {}",
                self.config.command.as_deref().unwrap_or_default(),
                e
            )
        })?;
        let pid = child.id().unwrap_or(0);
        info!(address = %self.config.address, pid, "Backend process spawned");

        *self.child.lock() = Some(child);
        Ok(())
    }

    fn terminate(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let child = self.child.lock().take();
            let Some(mut child) = child else {
                return;
            };
            let address = &self.config.address;

            if let Some(pid) = child.id() {
                info!(%address, pid, "Sending SIGTERM to backend");

                #[cfg(unix)]
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }

                #[cfg(not(unix))]
                {
                    let _ = child.start_kill();
                }
            }

            match tokio::time::timeout(self.grace_period, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(%address, ?status, "Backend process exited");
                }
                Ok(Err(e)) => {
                    warn!(%address, error = %e, "Error waiting for backend to exit");
                }
                Err(_) => {
                    warn!(
                        %address,
                        grace_period_secs = self.grace_period.as_secs(),
                        "Grace period exceeded, sending SIGKILL"
                    );
                    let _ = child.kill().await;
                }
            }
        })
    }
}

/// Remove a socket left behind by a previous run so the backend can bind.
/// Anything other than a socket at `path` is left alone and refused.
#[cfg(unix)]
fn remove_stale_socket(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if !metadata.file_type().is_socket() {
        anyhow::bail!(
            "Refusing to start backend: {} exists and is not a socket",
            path.display()
        );
    }

    debug!(path = %path.display(), "Removing stale socket file");
    std::fs::remove_file(path)?;
    Ok(())
}

#[cfg(not(unix))]
fn remove_stale_socket(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

/// A backend whose lifecycle is managed outside the proxy
#[derive(Debug, Clone)]
pub struct ExternalBackend {
    address: BackendAddress,
}

impl ExternalBackend {
    pub fn new(address: BackendAddress) -> Self {
        Self { address }
    }
}

impl BackendProcess for ExternalBackend {
    fn address(&self) -> &BackendAddress {
        &self.address
    }

    fn spawn(&self) -> anyhow::Result<()> {
        debug!(address = %self.address, "External backend, nothing to spawn");
        Ok(())
    }

    fn terminate(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts lifecycle calls instead of running anything
    #[derive(Debug)]
    pub(crate) struct MockProcess {
        address: BackendAddress,
        fail_spawn: bool,
        pub(crate) spawns: AtomicUsize,
        pub(crate) terminations: AtomicUsize,
    }

    impl MockProcess {
        pub(crate) fn new(address: BackendAddress) -> Arc<Self> {
            Arc::new(Self {
                address,
                fail_spawn: false,
                spawns: AtomicUsize::new(0),
                terminations: AtomicUsize::new(0),
            })
        }

        pub(crate) fn failing(address: BackendAddress) -> Arc<Self> {
            Arc::new(Self {
                address,
                fail_spawn: true,
                spawns: AtomicUsize::new(0),
                terminations: AtomicUsize::new(0),
            })
        }

        pub(crate) fn spawn_count(&self) -> usize {
            self.spawns.load(Ordering::SeqCst)
        }

        pub(crate) fn termination_count(&self) -> usize {
            self.terminations.load(Ordering::SeqCst)
        }
    }

    impl BackendProcess for MockProcess {
        fn address(&self) -> &BackendAddress {
            &self.address
        }

        fn spawn(&self) -> anyhow::Result<()> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            if self.fail_spawn {
                anyhow::bail!("mock spawn failure");
            }
            Ok(())
        }

        fn terminate(&self) -> BoxFuture<'_, ()> {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }
}

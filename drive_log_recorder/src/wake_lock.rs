use std::{fmt, process::Stdio};

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::config::WakeLockConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum WakeLockError {
    Unsupported,
    Denied(String),
}

impl fmt::Display for WakeLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported => write!(f, "Wake lock is not supported on this platform"),
            Self::Denied(message) => write!(f, "Wake lock was denied: {message}"),
        }
    }
}

impl std::error::Error for WakeLockError {}

#[async_trait]
pub trait WakeLockBackend: Send + Sync {
    async fn acquire(&mut self) -> Result<(), WakeLockError>;
    async fn release(&mut self) -> Result<(), WakeLockError>;
}

#[derive(Debug, Default)]
pub struct Unsupported;

#[async_trait]
impl WakeLockBackend for Unsupported {
    async fn acquire(&mut self) -> Result<(), WakeLockError> {
        Err(WakeLockError::Unsupported)
    }

    async fn release(&mut self) -> Result<(), WakeLockError> {
        Ok(())
    }
}

/// Holds the lock by keeping a child process alive, e.g. `systemd-inhibit`.
#[derive(Debug)]
pub struct InhibitorCommand {
    argv: Vec<String>,
    child: Option<Child>,
}

impl InhibitorCommand {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv, child: None }
    }
}

#[async_trait]
impl WakeLockBackend for InhibitorCommand {
    async fn acquire(&mut self) -> Result<(), WakeLockError> {
        if self.child.is_some() {
            return Ok(());
        }

        let Some((program, args)) = self.argv.split_first() else {
            return Err(WakeLockError::Unsupported);
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| WakeLockError::Denied(format!("{program}: {err}")))?;

        if let Ok(Some(status)) = child.try_wait() {
            return Err(WakeLockError::Denied(format!("{program} exited with {status}")));
        }

        self.child = Some(child);
        Ok(())
    }

    async fn release(&mut self) -> Result<(), WakeLockError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        child
            .kill()
            .await
            .map_err(|err| WakeLockError::Denied(format!("failed to stop inhibitor: {err}")))
    }
}

/// Best-effort "stay awake" while a trip is recorded. Failing to get or to
/// give back the lock never stops a recording.
pub struct WakeLockManager {
    backend: Box<dyn WakeLockBackend>,
    held: bool,
}

impl WakeLockManager {
    pub fn new(backend: Box<dyn WakeLockBackend>) -> Self {
        Self { backend, held: false }
    }

    pub fn from_config(config: &WakeLockConfig) -> Self {
        match &config.command {
            Some(argv) => Self::new(Box::new(InhibitorCommand::new(argv.clone()))),
            None => Self::new(Box::new(Unsupported)),
        }
    }

    pub async fn acquire(&mut self) -> Result<(), WakeLockError> {
        if self.held {
            return Ok(());
        }

        self.backend.acquire().await?;
        self.held = true;
        tracing::debug!("Wake lock acquired");
        Ok(())
    }

    /// Safe to call when the lock is not held.
    pub async fn release(&mut self) {
        if !self.held {
            return;
        }

        self.held = false;
        match self.backend.release().await {
            Ok(()) => tracing::debug!("Wake lock released"),
            Err(err) => tracing::warn!("Failed to release wake lock: {err}"),
        }
    }

    pub fn is_held(&self) -> bool {
        self.held
    }
}

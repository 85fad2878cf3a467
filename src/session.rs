//! Bearer-token storage and the forced-logout side channel.
//!
//! Authorization failures are handled globally: any 401 clears the stored
//! token and broadcasts `SessionEvent::LoggedOut` to every subscriber, rather
//! than being handled per call.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};

/// Route the UI navigates to after a forced logout.
pub const SIGN_IN_ROUTE: &str = "/login";

pub trait TokenStore: Send + Sync {
    fn token(&self) -> Option<String>;
    fn set_token(&self, token: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: RwLock<Option<String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: &str) -> Self {
        Self {
            token: RwLock::new(Some(token.to_string())),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn token(&self) -> Option<String> {
        self.token.read().ok().and_then(|guard| guard.clone())
    }

    fn set_token(&self, token: &str) -> Result<()> {
        let mut guard = self
            .token
            .write()
            .map_err(|_| anyhow!("token store lock poisoned"))?;
        *guard = Some(token.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut guard = self
            .token
            .write()
            .map_err(|_| anyhow!("token store lock poisoned"))?;
        *guard = None;
        Ok(())
    }
}

/// Token persisted as a single line in a 0600 file.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn token(&self) -> Option<String> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let token = raw.trim();
        if token.is_empty() {
            None
        } else {
            Some(token.to_string())
        }
    }

    fn set_token(&self, token: &str) -> Result<()> {
        std::fs::write(&self.path, format!("{token}\n"))
            .with_context(|| format!("write token file {}", self.path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.path, perms)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow!(
                "failed to remove token file {}: {}",
                self.path.display(),
                e
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedOut { redirect_to: String },
}

/// Broadcast channel for session-wide events.
#[derive(Clone, Default)]
pub struct SessionEvents {
    subscribers: Arc<Mutex<Vec<Sender<SessionEvent>>>>,
}

impl SessionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    /// Sends to every live subscriber, dropping the ones that hung up.
    pub fn emit(&self, event: SessionEvent) {
        let Ok(mut subs) = self.subscribers.lock() else {
            log::error!("session subscriber list poisoned; dropping {:?}", event);
            return;
        };
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Clears the stored token and tells every subscriber to return to sign-in.
    pub fn force_logout(&self, tokens: &dyn TokenStore) {
        if let Err(e) = tokens.clear() {
            log::warn!("failed to clear session token: {}", e);
        }
        log::warn!("session rejected by server; redirecting to {}", SIGN_IN_ROUTE);
        self.emit(SessionEvent::LoggedOut {
            redirect_to: SIGN_IN_ROUTE.to_string(),
        });
    }
}

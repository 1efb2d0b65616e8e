use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

pub const ERROR_LOG_FILE: &str = "error.log";

/// Append-only plain text log, one line per failed action.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    path: Option<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// `error.log` next to the running executable.
    pub fn beside_executable() -> Self {
        let dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        Self::new(dir.join(ERROR_LOG_FILE))
    }

    pub fn disabled() -> Self {
        Self {
            path: None,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self, message: &str) {
        let Some(path) = &self.path else {
            return;
        };
        let _guard = self.lock.lock();
        let res = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{}", message.trim_end()));
        if let Err(e) = res {
            warn!("Could not write to {}: {}", path.display(), e);
        }
    }
}

//! Drop-box notifications.
//!
//! Other programs write small files into `settings.notification_path`; each
//! write becomes an overlay on the device (or a config reload).

use crate::types::{ControlEvent, Notification};
use crossbeam_channel::Sender;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Deserialize)]
#[serde(untagged)]
enum Payload {
    Reload {
        reload: bool,
    },
    Message {
        message: String,
        #[serde(default)]
        duration: Option<Value>,
    },
}

/// Interprets the content of a dropped file.
///
/// JSON `{"message": .., "duration": ..}` and `{"reload": true}` are
/// understood; anything else non-empty is shown verbatim. Broken JSON is
/// treated as a half-written file and skipped.
pub fn parse_payload(content: &str) -> Option<ControlEvent> {
    let content = content.trim();
    if content.is_empty() {
        return None;
    }

    if !content.starts_with('{') {
        return Some(ControlEvent::Notify(Notification::new(content)));
    }

    match serde_json::from_str::<Payload>(content) {
        Ok(Payload::Reload { reload: true }) => Some(ControlEvent::Reload),
        Ok(Payload::Reload { reload: false }) => None,
        Ok(Payload::Message { message, duration }) => {
            let mut n = Notification::new(message);
            n.duration = duration.as_ref().and_then(duration_secs);
            Some(ControlEvent::Notify(n))
        }
        Err(e) => {
            debug!("Skipping incomplete notification payload: {}", e);
            None
        }
    }
}

fn duration_secs(v: &Value) -> Option<u32> {
    match v {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Watches one directory with the platform's native backend.
pub struct DirectoryWatcher {
    _watcher: RecommendedWatcher,
    dir: PathBuf,
}

impl DirectoryWatcher {
    pub fn start(dir: &Path, tx: Sender<ControlEvent>) -> anyhow::Result<Self> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }

        let mut last_seen: HashMap<PathBuf, String> = HashMap::new();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(ev) => ev,
                Err(e) => {
                    warn!("Notification watcher error: {:?}", e);
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            for path in event.paths {
                if !path.is_file() {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(&path) else {
                    continue;
                };
                // Backends report several modify events per write.
                if last_seen.get(&path) == Some(&content) {
                    continue;
                }
                last_seen.insert(path.clone(), content.clone());

                if let Some(control) = parse_payload(&content) {
                    debug!("Notification from {}: {:?}", path.display(), control);
                    let _ = tx.send(control);
                }
            }
        })?;

        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        info!("Watching {} for notifications", dir.display());

        Ok(Self {
            _watcher: watcher,
            dir: dir.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

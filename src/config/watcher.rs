//! 配置热重载：监听配置文件变化并重新应用到 provider 注册表。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{GatewayConfig, ProviderRegistry};
use crate::error::{Error, ErrorContext};
use crate::Result;

/// Editors often write a file in several steps; events arriving within this
/// window are folded into one reload.
const DEBOUNCE: Duration = Duration::from_millis(150);

/// Result of one reload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadEvent {
    /// The new document was applied.
    Applied { providers: usize },
    /// The document was unreadable or invalid; the previous table stays live.
    Rejected { error: String },
}

/// Re-read `path` and apply it to `registry`.
pub fn reload_into(path: &Path, registry: &ProviderRegistry) -> ReloadEvent {
    let outcome = GatewayConfig::from_path(path).and_then(|cfg| registry.apply(&cfg));
    match outcome {
        Ok(providers) => {
            info!(path = %path.display(), providers, "gateway config reloaded");
            ReloadEvent::Applied { providers }
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "config reload rejected, keeping previous providers");
            ReloadEvent::Rejected {
                error: e.to_string(),
            }
        }
    }
}

/// Watches a config file and re-applies it whenever it changes.
///
/// Dropping the watcher stops watching.
pub struct ConfigWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("path", &self.path)
            .finish()
    }
}

impl ConfigWatcher {
    /// Start watching `path`. Reload outcomes are reported on the returned
    /// receiver; a consumer that falls behind misses events but never stalls
    /// reloading.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        path: impl AsRef<Path>,
        registry: Arc<ProviderRegistry>,
    ) -> Result<(Self, mpsc::Receiver<ReloadEvent>)> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config file not found: {}", path.display()),
            )));
        }
        let file_name = path.file_name().map(|n| n.to_os_string());
        // Watch the directory so that atomic replace-by-rename is seen too.
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if ours {
                        let _ = raw_tx.send(());
                    }
                }
                Err(e) => warn!(error = %e, "config watcher error"),
            }
        })
        .map_err(watch_error)?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(watch_error)?;

        let (tx, rx) = mpsc::channel(16);
        let task_path = path.clone();
        let task = tokio::spawn(async move {
            while raw_rx.recv().await.is_some() {
                tokio::time::sleep(DEBOUNCE).await;
                while raw_rx.try_recv().is_ok() {}
                if !task_path.is_file() {
                    debug!(path = %task_path.display(), "config file missing, waiting for it to reappear");
                    continue;
                }
                let event = reload_into(&task_path, &registry);
                let _ = tx.try_send(event);
            }
        });

        info!(path = %path.display(), "watching gateway config");
        Ok((
            Self {
                path,
                _watcher: watcher,
                task,
            },
            rx,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn watch_error(e: notify::Error) -> Error {
    Error::configuration_with_context(
        format!("failed to watch config file: {e}"),
        ErrorContext::new().with_source("config_watcher"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE: &str = "providers:\n  - identity: a\n    adapter: openai\n    endpoint: http://127.0.0.1:9/v1/chat/completions\n";
    const TWO: &str = "providers:\n  - identity: a\n    adapter: openai\n    endpoint: http://127.0.0.1:9/v1/chat/completions\n  - identity: b\n    adapter: dify\n    endpoint: http://127.0.0.1:9/v1/chat-messages\n";
    const BROKEN: &str = "providers:\n  - identity: a\n    adapter: openai\n    endpoint: nope\n";

    fn temp_config(contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ai-gateway-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("gateway.yaml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_reload_into_applies_and_rejects() {
        let path = temp_config(ONE);
        let registry = ProviderRegistry::new();
        assert_eq!(
            reload_into(&path, &registry),
            ReloadEvent::Applied { providers: 1 }
        );

        std::fs::write(&path, BROKEN).unwrap();
        assert!(matches!(
            reload_into(&path, &registry),
            ReloadEvent::Rejected { .. }
        ));
        assert_eq!(registry.len(), 1);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_spawn_requires_existing_file() {
        let registry = Arc::new(ProviderRegistry::new());
        let missing = std::env::temp_dir().join("ai-gateway-definitely-missing.yaml");
        assert!(ConfigWatcher::spawn(&missing, registry).is_err());
    }

    #[tokio::test]
    async fn test_file_change_triggers_reload() {
        let path = temp_config(ONE);
        let registry = Arc::new(ProviderRegistry::new());
        reload_into(&path, &registry);

        let (_watcher, mut events) = ConfigWatcher::spawn(&path, Arc::clone(&registry)).unwrap();
        std::fs::write(&path, TWO).unwrap();

        // a write may surface as several bursts; wait for the one with both providers
        let applied = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = events.recv().await {
                if event == (ReloadEvent::Applied { providers: 2 }) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(applied);
        assert!(registry.get("b").is_some());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}

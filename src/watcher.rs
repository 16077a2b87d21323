//! File system watcher for configuration changes

use anyhow::Result;
use notify::{Event, EventKind, RecursiveMode, Result as NotifyResult, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::service::Sandbox;

/// Configuration file watcher
pub struct ConfigWatcher {
    watcher: notify::RecommendedWatcher,
    receiver: Receiver<NotifyResult<Event>>,
}

impl ConfigWatcher {
    pub fn new() -> NotifyResult<Self> {
        let (sender, receiver) = channel();

        let watcher = notify::recommended_watcher(move |res| {
            let _ = sender.send(res);
        })?;

        Ok(Self { watcher, receiver })
    }

    /// Watch the directory holding `path`, so replace-by-rename saves are seen
    pub fn watch_file(&mut self, path: impl AsRef<Path>) -> NotifyResult<()> {
        self.watcher
            .watch(parent_dir(path.as_ref()), RecursiveMode::NonRecursive)
    }

    /// Drain pending create, modify and remove events
    pub fn check_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        while let Ok(res) = self.receiver.try_recv() {
            match res {
                Ok(event) => match event.kind {
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
                        events.push(event);
                    }
                    _ => {}
                },
                Err(e) => warn!("Config watcher error: {}", e),
            }
        }

        events
    }

    /// Whether any pending event touched a file named like `config_path`
    pub fn config_changed(&self, config_path: &Path) -> bool {
        let Some(name) = config_path.file_name() else {
            return false;
        };
        self.check_events()
            .iter()
            .flat_map(|event| event.paths.iter())
            .any(|p| p.file_name() == Some(name))
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Reloads a [`Sandbox`] when its configuration file changes
pub struct AutoReload {
    watcher: ConfigWatcher,
    config_path: PathBuf,
    last_reload: Option<Instant>,
    min_reload_interval: Duration,
    pending: bool,
}

impl AutoReload {
    pub fn new(config_path: impl Into<PathBuf>) -> NotifyResult<Self> {
        let config_path = config_path.into();
        let mut watcher = ConfigWatcher::new()?;
        watcher.watch_file(&config_path)?;

        Ok(Self {
            watcher,
            config_path,
            last_reload: None,
            min_reload_interval: Duration::from_secs(1),
            pending: false,
        })
    }

    pub fn set_min_reload_interval(&mut self, interval: Duration) {
        self.min_reload_interval = interval;
    }

    /// Whether the file changed and the minimum interval has passed
    pub fn should_reload(&mut self) -> bool {
        if self.watcher.config_changed(&self.config_path) {
            self.pending = true;
        }
        if !self.pending {
            return false;
        }
        // A change seen too early stays pending for the next poll
        match self.last_reload {
            Some(at) => at.elapsed() >= self.min_reload_interval,
            None => true,
        }
    }

    /// Reload `sandbox` if the file changed. A file that fails to load or
    /// validate is logged and the running configuration is kept.
    pub fn poll(&mut self, sandbox: &Sandbox) -> Result<bool> {
        if !self.should_reload() {
            return Ok(false);
        }
        self.pending = false;
        self.last_reload = Some(Instant::now());

        debug!("Config file {} changed", self.config_path.display());
        let config = SandboxConfig::load(&self.config_path)?;
        sandbox.reload(config)?;
        info!("Reloaded configuration from {}", self.config_path.display());
        Ok(true)
    }

    /// Poll every `period` until the task is dropped
    pub async fn run(mut self, sandbox: Arc<Sandbox>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll(&sandbox) {
                warn!("Keeping current configuration: {:#}", e);
            }
        }
    }
}

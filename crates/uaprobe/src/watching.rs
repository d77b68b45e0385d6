//! Auto-reloading dataset wrapper
//!
//! [`WatchingDataset`] keeps a [`CompiledTree`] published behind an
//! [`ArcSwap`] and replaces it whenever the dataset file changes. Lookups in
//! flight keep using the tree they started with.
//!
//! ```no_run
//! use uaprobe::WatchingDataset;
//!
//! let dataset = WatchingDataset::from("devices.json")
//!     .on_reload(|event| {
//!         if event.success {
//!             eprintln!("reloaded: generation {}", event.generation);
//!         }
//!     })
//!     .open()?;
//!
//! let props = dataset.lookup("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0)", None)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::dataset::{CompiledTree, DatasetOptions};
use crate::error::{DatasetError, Result};
use crate::lookup::Properties;
use arc_swap::ArcSwap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uaprobe_value::Value;

const DEBOUNCE: Duration = Duration::from_millis(200);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Event fired after each reload attempt
#[derive(Debug, Clone)]
pub struct ReloadEvent {
    /// Dataset file
    pub path: PathBuf,
    /// Whether the new file loaded
    pub success: bool,
    /// Load error, on failure
    pub error: Option<String>,
    /// Generation after the attempt
    pub generation: u64,
}

/// Callback type for reload notifications
pub type ReloadCallback = Arc<dyn Fn(ReloadEvent) + Send + Sync>;

struct WatcherThread {
    shutdown_tx: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Drop for WatcherThread {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct WatcherState {
    // dropping the watcher stops file events
    _watcher: notify::RecommendedWatcher,
    _thread: WatcherThread,
}

/// A dataset that reloads itself when its file changes
pub struct WatchingDataset {
    current: Arc<ArcSwap<CompiledTree>>,
    generation: Arc<AtomicU64>,
    _watcher: WatcherState,
}

impl WatchingDataset {
    /// Start configuring a watched dataset at `path`
    pub fn from(path: impl Into<PathBuf>) -> WatchingDatasetOpener {
        WatchingDatasetOpener::new(path)
    }

    /// Typed bulk lookup against the current tree
    pub fn lookup(&self, input: &str, overlay: Option<&str>) -> Result<Properties> {
        self.current.load().lookup(input, overlay, true)
    }

    /// Single attribute lookup against the current tree
    pub fn lookup_single(&self, input: &str, name: &str, overlay: Option<&str>) -> Result<Value> {
        self.current.load().lookup_single(input, name, overlay)
    }

    /// Number of successful loads, starting at 1
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// The current tree, for several operations against one version
    pub fn snapshot(&self) -> Arc<CompiledTree> {
        self.current.load_full()
    }
}

/// Builder for [`WatchingDataset`]
pub struct WatchingDatasetOpener {
    options: DatasetOptions,
    reload_callback: Option<ReloadCallback>,
}

impl WatchingDatasetOpener {
    fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            options: DatasetOptions {
                path: path.into(),
                ..Default::default()
            },
            reload_callback: None,
        }
    }

    /// Keep or drop the UA regex rules
    pub fn ua_rules(mut self, enabled: bool) -> Self {
        self.options.ua_rules = enabled;
        self
    }

    /// Callback invoked after every reload attempt, successful or not
    pub fn on_reload<F>(mut self, callback: F) -> Self
    where
        F: Fn(ReloadEvent) + Send + Sync + 'static,
    {
        self.reload_callback = Some(Arc::new(callback));
        self
    }

    /// Load the dataset and start watching it
    pub fn open(self) -> std::result::Result<WatchingDataset, DatasetError> {
        use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
        use std::sync::mpsc::RecvTimeoutError;

        let canonical = self
            .options
            .path
            .canonicalize()
            .map_err(|e| DatasetError::io(&self.options.path, e))?;
        let mut options = self.options;
        options.path = canonical.clone();

        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();

        let mut watcher = RecommendedWatcher::new(event_tx, Config::default()).map_err(|source| {
            DatasetError::Watch {
                path: canonical.clone(),
                source,
            }
        })?;
        watcher
            .watch(&canonical, RecursiveMode::NonRecursive)
            .map_err(|source| DatasetError::Watch {
                path: canonical.clone(),
                source,
            })?;

        let initial = CompiledTree::open_with_options(&options)?;
        let current = Arc::new(ArcSwap::from_pointee(initial));
        let generation = Arc::new(AtomicU64::new(1));

        let thread_current = Arc::clone(&current);
        let thread_generation = Arc::clone(&generation);
        let callback = self.reload_callback;

        let handle = thread::spawn(move || {
            let mut last_event: Option<Instant> = None;

            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                match event_rx.recv_timeout(POLL_INTERVAL) {
                    Ok(Ok(_)) => last_event = Some(Instant::now()),
                    Ok(Err(e)) => warn!(error = %e, "file watcher error"),
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(at) = last_event else { continue };
                        if at.elapsed() < DEBOUNCE {
                            continue;
                        }
                        last_event = None;

                        let event = match CompiledTree::open_with_options(&options) {
                            Ok(tree) => {
                                let gen = thread_generation.fetch_add(1, Ordering::AcqRel) + 1;
                                thread_current.store(Arc::new(tree));
                                info!(path = %options.path.display(), generation = gen, "dataset reloaded");
                                ReloadEvent {
                                    path: options.path.clone(),
                                    success: true,
                                    error: None,
                                    generation: gen,
                                }
                            }
                            Err(e) => {
                                warn!(path = %options.path.display(), error = %e, "dataset reload failed, keeping previous version");
                                ReloadEvent {
                                    path: options.path.clone(),
                                    success: false,
                                    error: Some(e.to_string()),
                                    generation: thread_generation.load(Ordering::Acquire),
                                }
                            }
                        };
                        if let Some(callback) = &callback {
                            callback(event);
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        Ok(WatchingDataset {
            current,
            generation,
            _watcher: WatcherState {
                _watcher: watcher,
                _thread: WatcherThread {
                    shutdown_tx,
                    handle: Some(handle),
                },
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const SAMPLE: &str = include_str!("../tests/data/sample.json");

    #[test]
    fn test_initial_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("devices.json");
        fs::write(&path, SAMPLE).unwrap();

        let dataset = WatchingDataset::from(&path).open().unwrap();
        assert_eq!(dataset.generation(), 1);
        let props = dataset.lookup("Googlebot/2.1", None).unwrap();
        assert_eq!(props.get("isRobot"), Some(&Value::Bool(true)));
        assert_eq!(dataset.snapshot().revision(), 28419);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let result = WatchingDataset::from(dir.path().join("absent.json")).open();
        assert!(matches!(result, Err(DatasetError::Io { .. })));
    }

    #[test]
    fn test_reload_on_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("devices.json");
        fs::write(&path, SAMPLE).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let dataset = WatchingDataset::from(&path)
            .on_reload(move |event| sink.lock().unwrap().push(event))
            .open()
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        fs::write(&path, SAMPLE.replace("$Rev: 28419 $", "$Rev: 28420 $")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while dataset.generation() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }

        if dataset.generation() >= 2 {
            assert_eq!(dataset.snapshot().revision(), 28420);
            let events = events.lock().unwrap();
            assert!(events.iter().any(|e| e.success));
        } else {
            // some CI filesystems do not deliver change events
            eprintln!("no file event received, skipping reload assertions");
        }
    }
}

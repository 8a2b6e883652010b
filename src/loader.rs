//! Asynchronous image decode and joint readiness tracking.
//!
//! Decode work happens on worker threads; results travel back over a
//! `crossbeam_channel` and are applied by the orchestration thread. No other
//! thread ever touches GPU state. A failed decode is reported once and the
//! affected input stays unready; there is no retry or cancellation.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Completion message for one decode request.
pub struct LoadCompletion {
    pub name: String,
    pub result: Result<image::DynamicImage, String>,
}

/// Fans decode requests out to worker threads and funnels completions into
/// one channel.
pub struct ImageLoader {
    tx: Sender<LoadCompletion>,
    rx: Receiver<LoadCompletion>,
}

impl ImageLoader {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        ImageLoader { tx, rx }
    }

    /// Start decoding `path` for the input `name`. Returns immediately; the
    /// completion arrives on [`completions`](Self::completions).
    pub fn request(&self, name: String, path: PathBuf) {
        let tx = self.tx.clone();
        thread::spawn(move || {
            let result = image::open(&path)
                .map_err(|e| format!("failed to decode {}: {}", path.display(), e));
            // The receiver dropping just means the pipeline is gone.
            let _ = tx.send(LoadCompletion { name, result });
        });
    }

    pub fn completions(&self) -> &Receiver<LoadCompletion> {
        &self.rx
    }
}

impl Default for ImageLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of registering a readiness watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Every watched name was already ready; the waiter fires now.
    AlreadyReady(String),
    /// The returned key will appear in a later [`ReadinessCoordinator::mark_ready`].
    Pending(String),
}

/// Tracks which named resources are ready and which name-sets are waited on.
///
/// Keys are canonical (sorted, `|`-joined), so the same set registered twice
/// is one waiter. Waiting is level-triggered: names that were ready before
/// the watch count, and a watch over an already-satisfied set fires
/// synchronously. Each waiter fires exactly once.
pub struct ReadinessCoordinator {
    ready: BTreeSet<String>,
    waiters: BTreeMap<String, BTreeSet<String>>,
}

impl ReadinessCoordinator {
    pub fn new() -> Self {
        ReadinessCoordinator {
            ready: BTreeSet::new(),
            waiters: BTreeMap::new(),
        }
    }

    /// Canonical key of a name-set: sorted names joined with `|`.
    pub fn canonical_key<I, S>(names: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sorted: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        sorted.into_iter().collect::<Vec<_>>().join("|")
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.ready.contains(name)
    }

    /// Register interest in a set of names.
    pub fn watch<I, S>(&mut self, names: I) -> WatchOutcome
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        let key = set.iter().cloned().collect::<Vec<_>>().join("|");
        let pending: BTreeSet<String> =
            set.difference(&self.ready).cloned().collect();
        if pending.is_empty() {
            WatchOutcome::AlreadyReady(key)
        } else {
            self.waiters.insert(key.clone(), pending);
            WatchOutcome::Pending(key)
        }
    }

    /// Mark one name ready and collect the keys of every waiter this
    /// satisfies. A satisfied waiter is removed and never fires again.
    pub fn mark_ready(&mut self, name: &str) -> Vec<String> {
        self.ready.insert(name.to_string());
        let mut fired = Vec::new();
        self.waiters.retain(|key, pending| {
            pending.remove(name);
            if pending.is_empty() {
                fired.push(key.clone());
                false
            } else {
                true
            }
        });
        fired
    }

    /// Forget readiness for a name, e.g. when its backing value is replaced
    /// with a new path and a fresh decode begins.
    pub fn reset(&mut self, name: &str) {
        self.ready.remove(name);
    }
}

impl Default for ReadinessCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_order_independent() {
        let a = ReadinessCoordinator::canonical_key(["b", "a", "c"]);
        let b = ReadinessCoordinator::canonical_key(["c", "a", "b"]);
        assert_eq!(a, b);
        assert_eq!(a, "a|b|c");
    }

    #[test]
    fn empty_set_is_ready_synchronously() {
        let mut coord = ReadinessCoordinator::new();
        let names: [&str; 0] = [];
        assert_eq!(coord.watch(names), WatchOutcome::AlreadyReady(String::new()));
    }

    #[test]
    fn watch_is_level_triggered() {
        let mut coord = ReadinessCoordinator::new();
        coord.mark_ready("u_image");
        // Readiness established before the watch still counts.
        assert_eq!(
            coord.watch(["u_image"]),
            WatchOutcome::AlreadyReady("u_image".to_string())
        );

        assert_eq!(
            coord.watch(["u_image", "u_mask"]),
            WatchOutcome::Pending("u_image|u_mask".to_string())
        );
        assert_eq!(coord.mark_ready("u_mask"), vec!["u_image|u_mask".to_string()]);
    }

    #[test]
    fn each_waiter_fires_exactly_once() {
        let mut coord = ReadinessCoordinator::new();
        coord.watch(["u_mask"]);
        assert_eq!(coord.mark_ready("u_mask"), vec!["u_mask".to_string()]);
        // Marking again finds no waiter left.
        assert!(coord.mark_ready("u_mask").is_empty());
    }

    #[test]
    fn one_event_can_satisfy_several_waiters() {
        let mut coord = ReadinessCoordinator::new();
        coord.mark_ready("u_image");
        coord.watch(["u_image", "u_mask"]);
        coord.watch(["u_mask"]);
        let mut fired = coord.mark_ready("u_mask");
        fired.sort();
        assert_eq!(fired, vec!["u_image|u_mask".to_string(), "u_mask".to_string()]);
    }

    #[test]
    fn loader_reports_decode_failure_on_the_channel() {
        let loader = ImageLoader::new();
        loader.request(
            "u_image".to_string(),
            PathBuf::from("/nonexistent/definitely-missing.png"),
        );
        let completion = loader
            .completions()
            .recv_timeout(std::time::Duration::from_secs(10))
            .unwrap();
        assert_eq!(completion.name, "u_image");
        assert!(completion.result.is_err());
    }

    #[test]
    fn loader_decodes_a_real_file() {
        let dir = std::env::temp_dir().join(format!("sdfgen-loader-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tiny.png");
        image::save_buffer(&path, &[0u8, 0, 0, 255], 1, 1, image::ColorType::Rgba8).unwrap();

        let loader = ImageLoader::new();
        loader.request("u_image".to_string(), path);
        let completion = loader
            .completions()
            .recv_timeout(std::time::Duration::from_secs(10))
            .unwrap();
        let img = completion.result.unwrap();
        assert_eq!((img.width(), img.height()), (1, 1));
    }
}

//! Image save worker
//!
//! One thread drains a bounded queue of frames to the history directory.
//! Pushing never blocks: frames beyond the bound are dropped.

use crate::InspectionError;
use camera_capture::Frame;
use chrono::Local;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Raw camera frame or drawn result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Origin,
    Result,
}

impl ImageKind {
    fn dir(&self) -> &'static str {
        match self {
            ImageKind::Origin => "origin",
            ImageKind::Result => "resultImage",
        }
    }
}

/// One frame to write
#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub frame: Frame,
    pub kind: ImageKind,
    pub ok: bool,
    pub product_count: u64,
    pub shot: u32,
}

/// `<root>/<origin|resultImage>/<good|bad>/<timestamp>-CNT<n>-PIC<shot>.png`
pub fn history_path(root: &Path, kind: ImageKind, ok: bool, timestamp: &str, product_count: u64, shot: u32) -> PathBuf {
    root.join(kind.dir())
        .join(if ok { "good" } else { "bad" })
        .join(format!("{}-CNT{}-PIC{}.png", timestamp, product_count, shot))
}

struct Queue {
    items: VecDeque<SaveRequest>,
    hung_up: bool,
    stopped: bool,
}

struct Shared {
    name: String,
    root: PathBuf,
    max_size: usize,
    queue: Mutex<Queue>,
    ready: Condvar,
    saved: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn run(&self) {
        loop {
            let request = {
                let Ok(mut queue) = self.queue.lock() else {
                    error!("Save worker {} lock poisoned", self.name);
                    return;
                };
                while !queue.stopped && (queue.items.is_empty() || queue.hung_up) {
                    queue = match self.ready.wait(queue) {
                        Ok(q) => q,
                        Err(e) => {
                            error!("Save worker {} lock poisoned: {}", self.name, e);
                            return;
                        }
                    };
                }
                if queue.stopped {
                    return;
                }
                match queue.items.pop_front() {
                    Some(r) => r,
                    None => continue,
                }
            };
            self.save(&request);
        }
    }

    fn save(&self, request: &SaveRequest) {
        let timestamp = Local::now().format("%Y%m%d%H%M%S%3f").to_string();
        let path = history_path(
            &self.root,
            request.kind,
            request.ok,
            &timestamp,
            request.product_count,
            request.shot,
        );
        match request.frame.save(&path) {
            Ok(()) => {
                self.saved.fetch_add(1, Ordering::Relaxed);
                debug!("Saved {}", path.display());
            }
            Err(e) => warn!("Save worker {} failed to write {}: {}", self.name, path.display(), e),
        }
    }
}

/// Background image writer
pub struct ImageSaveWorker {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ImageSaveWorker {
    /// Spawn the worker thread
    pub fn start(name: &str, root: &Path, max_size: usize) -> Result<Self, InspectionError> {
        let shared = Arc::new(Shared {
            name: name.to_string(),
            root: root.to_path_buf(),
            max_size: max_size.max(1),
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                hung_up: false,
                stopped: false,
            }),
            ready: Condvar::new(),
            saved: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("save-{}", name))
            .spawn(move || worker.run())?;
        info!("Save worker {} writing to {}", name, root.display());
        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a frame; returns false when it was dropped
    pub fn push(&self, request: SaveRequest) -> bool {
        let Ok(mut queue) = self.shared.queue.lock() else {
            return false;
        };
        if queue.stopped || queue.items.len() >= self.shared.max_size {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Save worker {} queue full, dropping frame", self.shared.name);
            return false;
        }
        queue.items.push_back(request);
        if !queue.hung_up {
            self.shared.ready.notify_one();
        }
        true
    }

    /// Pause writing
    pub fn hang_up(&self) {
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.hung_up = true;
        }
    }

    /// Resume writing
    pub fn wake_up(&self) {
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.hung_up = false;
            if !queue.items.is_empty() {
                self.shared.ready.notify_one();
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().map(|q| q.items.len()).unwrap_or(0)
    }

    pub fn saved_count(&self) -> u64 {
        self.shared.saved.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Stop the thread and wait for it; queued frames are discarded
    pub fn stop(&self) {
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.stopped = true;
        }
        self.shared.ready.notify_all();
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Save worker {} panicked", self.shared.name);
            }
            info!("Save worker {} stopped", self.shared.name);
        }
    }
}

impl Drop for ImageSaveWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn request(ok: bool, count: u64) -> SaveRequest {
        SaveRequest {
            frame: Frame::filled(8, 4, 3, 100),
            kind: ImageKind::Origin,
            ok,
            product_count: count,
            shot: 1,
        }
    }

    fn wait_for(pred: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn temp_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("inspect-save-{}-{}", tag, std::process::id()))
    }

    #[test]
    fn test_history_path_layout() {
        let path = history_path(Path::new("/opt/history"), ImageKind::Result, false, "20240101", 12, 2);
        assert_eq!(
            path,
            PathBuf::from("/opt/history/resultImage/bad/20240101-CNT12-PIC2.png")
        );
    }

    #[test]
    fn test_saves_frames() {
        let root = temp_root("saves");
        let worker = ImageSaveWorker::start("test", &root, 10).unwrap();
        assert!(worker.push(request(true, 1)));
        assert!(worker.push(request(false, 2)));
        assert!(wait_for(|| worker.saved_count() == 2));
        worker.stop();

        let good = std::fs::read_dir(root.join("origin/good")).unwrap().count();
        let bad = std::fs::read_dir(root.join("origin/bad")).unwrap().count();
        assert_eq!((good, bad), (1, 1));
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_hang_up_and_bound() {
        let root = temp_root("hangup");
        let worker = ImageSaveWorker::start("test", &root, 2).unwrap();
        worker.hang_up();
        assert!(worker.push(request(true, 1)));
        assert!(worker.push(request(true, 2)));
        assert!(!worker.push(request(true, 3)));
        assert_eq!(worker.dropped_count(), 1);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(worker.saved_count(), 0);
        assert_eq!(worker.pending(), 2);

        worker.wake_up();
        assert!(wait_for(|| worker.saved_count() == 2));
        worker.stop();
        assert!(!worker.push(request(true, 4)));
        let _ = std::fs::remove_dir_all(&root);
    }
}

//! The optional background maintenance worker (spec.md §4.9), grounded on `anchored-leveldb`'s
//! `compactor` module: a dedicated thread owns the mutable state (here, the shared
//! `Arc<Mutex<Inner>>`) and a handle living on the caller's thread talks to it over a
//! `std::sync::mpsc` channel, mirroring `MpscHandle`'s sender/receiver split.
//!
//! Every maintenance operation already has a synchronous, inline equivalent on [`ManagedDTable`]
//! (spec.md's "non-background variants run inline"); the worker's only job is to call
//! `Inner::maintain(false)` on a timer so a caller that never calls `maintain` itself still gets
//! periodic digests and combines.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::managed::Inner;


/// Lower bound on the worker's poll tick, so a tiny `digest_interval`/`combine_interval` doesn't
/// turn into a busy loop.
const MIN_TICK: Duration = Duration::from_millis(50);

pub(crate) struct WorkerHandle {
    stop:   mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle").finish_non_exhaustive()
    }
}

impl WorkerHandle {
    pub(crate) fn spawn(inner: Arc<Mutex<Inner>>) -> Self {
        let (stop, stop_rx) = mpsc::channel();
        let tick = {
            let guard = inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.poll_tick().max(MIN_TICK)
        };
        let thread = std::thread::Builder::new()
            .name("managed-dtable-maintain".to_owned())
            .spawn(move || worker_loop(&inner, &stop_rx, tick))
            .expect("spawning the background maintenance thread");
        Self { stop, thread: Some(thread) }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn worker_loop(inner: &Arc<Mutex<Inner>>, stop_rx: &mpsc::Receiver<()>, tick: Duration) {
    loop {
        match stop_rx.recv_timeout(tick) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {
                let mut guard = inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Err(error) = guard.maintain(false) {
                    tracing::warn!(?error, "background maintenance pass failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use blob_key::{Blob, Key, KeyType};

    use crate::config::ManagedDTableConfig;
    use crate::managed::ManagedDTable;

    #[test]
    fn background_worker_digests_the_tip_on_a_timer() {
        let dir = std::env::temp_dir().join(format!("worker-test-digest-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        // `digest_size` set past anything this test inserts, so only the timer-driven background
        // maintain pass (not the insert-triggered size check) can cause the digest.
        let config = ManagedDTableConfig {
            digest_interval: Duration::from_millis(10),
            digest_size:     usize::MAX,
            ..ManagedDTableConfig::default()
        };

        let mut table = ManagedDTable::create(&dir, KeyType::U32, None, config).unwrap();
        table.insert(Key::U32(1), Blob::present(*b"v"), false).unwrap();
        table.spawn_background();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !dir.join("md_data.0").exists() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        table.stop_background();

        assert!(dir.join("md_data.0").exists(), "background worker never digested the tip in time");
        assert_eq!(table.lookup(&Key::U32(1)).1.as_bytes(), Some(&b"v"[..]));
    }
}

//! Progress reporting for extraction.
//!
//! The core never renders anything itself: hosts implement [`ProgressSink`]
//! and wire it to whatever UI they prefer. [`FileProgress`] aggregates the
//! decompressed byte count of one file task — across segment workers when
//! the file is segmented — and throttles sink updates to a 100 ms cadence.
//! Progress is advisory only; it never affects correctness.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Receives per-file progress updates.
pub trait ProgressSink: Send + Sync {
    /// `bytes_done` decompressed out of `bytes_expected` for `name`.
    fn update(&self, name: &str, bytes_expected: u64, bytes_done: u64);
}

/// Sink that discards all updates.
#[derive(Debug, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn update(&self, _name: &str, _bytes_expected: u64, _bytes_done: u64) {}
}

const EMIT_INTERVAL: Duration = Duration::from_millis(100);

/// Throttled byte counter for one file task.
pub struct FileProgress<'a> {
    sink: &'a dyn ProgressSink,
    name: &'a str,
    expected: u64,
    state: Mutex<Inner>,
}

struct Inner {
    done: u64,
    last_emit: Instant,
}

impl<'a> FileProgress<'a> {
    /// Create the counter and emit the initial zero update.
    pub fn new(sink: &'a dyn ProgressSink, name: &'a str, expected: u64) -> Self {
        sink.update(name, expected, 0);
        FileProgress {
            sink,
            name,
            expected,
            state: Mutex::new(Inner {
                done: 0,
                last_emit: Instant::now(),
            }),
        }
    }

    /// Record `delta` freshly decompressed bytes. Emits at most every 100 ms,
    /// except that reaching the expected total always emits.
    pub fn add(&self, delta: u64) {
        let mut state = self.state.lock().unwrap();
        state.done += delta;
        let now = Instant::now();
        if state.done >= self.expected || now.duration_since(state.last_emit) >= EMIT_INTERVAL {
            state.last_emit = now;
            let done = state.done;
            drop(state);
            self.sink.update(self.name, self.expected, done);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        updates: StdMutex<Vec<(String, u64, u64)>>,
    }

    impl ProgressSink for RecordingSink {
        fn update(&self, name: &str, expected: u64, done: u64) {
            self.updates
                .lock()
                .unwrap()
                .push((name.to_string(), expected, done));
        }
    }

    #[test]
    fn emits_initial_and_final_updates() {
        let sink = RecordingSink::default();
        let progress = FileProgress::new(&sink, "boot", 100);
        progress.add(40);
        progress.add(60);
        let updates = sink.updates.lock().unwrap();
        assert_eq!(updates.first().unwrap(), &("boot".to_string(), 100, 0));
        assert_eq!(updates.last().unwrap(), &("boot".to_string(), 100, 100));
    }

    #[test]
    fn throttles_intermediate_updates() {
        let sink = RecordingSink::default();
        let progress = FileProgress::new(&sink, "system", 10_000);
        for _ in 0..100 {
            progress.add(1);
        }
        // 100 rapid sub-total additions collapse under the 100 ms throttle.
        let count = sink.updates.lock().unwrap().len();
        assert!(count < 10, "expected throttling, saw {} updates", count);
    }

    #[test]
    fn aggregates_across_threads() {
        let sink = RecordingSink::default();
        let progress = FileProgress::new(&sink, "super", 4 * 256);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..256 {
                        progress.add(1);
                    }
                });
            }
        });
        let updates = sink.updates.lock().unwrap();
        assert_eq!(updates.last().unwrap().2, 4 * 256);
    }
}

//! Read-copy-update cell for configuration snapshots.
//!
//! Readers are wait-free: `load` follows an atomic pointer and bumps the
//! reader count of the generation it observed. The single writer swaps in a
//! new generation and then polls the previous generation's reader count
//! until it drains or the timeout elapses. On timeout the writer gets
//! [`UpstreamError::RcuBlocked`]; the new value is already visible to every
//! subsequent reader, the old generation just stays referenced one cycle
//! longer.
//!
//! Writers must be externally serialized (the primary cluster's update mutex
//! does this).

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;

use meshline_common::{Result, UpstreamError};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_micros(500);

#[derive(Debug)]
struct Generation<T> {
    value: T,
    readers: AtomicUsize,
}

/// RCU cell holding the current generation of a value.
#[derive(Debug)]
pub struct Value<T> {
    current: ArcSwap<Generation<T>>,
}

/// Read ticket pinning one generation. Dropping it releases the ticket.
#[derive(Debug)]
pub struct ReadGuard<T> {
    generation: Arc<Generation<T>>,
}

impl<T> Value<T> {
    pub fn new(value: T) -> Self {
        Value {
            current: ArcSwap::from_pointee(Generation {
                value,
                readers: AtomicUsize::new(0),
            }),
        }
    }

    /// Pins and returns the current generation. Never blocks.
    pub fn load(&self) -> ReadGuard<T> {
        let generation = self.current.load_full();
        generation.readers.fetch_add(1, Ordering::AcqRel);
        ReadGuard { generation }
    }

    /// Publishes `value` as the new generation, then waits for readers of
    /// the previous generation to drain. Returns [`UpstreamError::RcuBlocked`]
    /// if they have not drained within `timeout`; the new value is active
    /// either way.
    pub fn update(&self, value: T, timeout: Duration) -> Result<()> {
        let previous = self.current.swap(Arc::new(Generation {
            value,
            readers: AtomicUsize::new(0),
        }));

        let deadline = Instant::now() + timeout;
        loop {
            if previous.readers.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(UpstreamError::RcuBlocked);
            }
            std::thread::sleep(DRAIN_POLL_INTERVAL);
        }
    }

    /// Reader count of the current generation. Test and introspection hook.
    pub fn current_readers(&self) -> usize {
        self.current.load().readers.load(Ordering::Acquire)
    }
}

impl<T> Deref for ReadGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.generation.value
    }
}

impl<T> Drop for ReadGuard<T> {
    fn drop(&mut self) {
        self.generation.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_load_sees_current_value() {
        let cell = Value::new(1u32);
        assert_eq!(*cell.load(), 1);
        cell.update(2, Duration::from_millis(100)).unwrap();
        assert_eq!(*cell.load(), 2);
    }

    #[test]
    fn test_reader_count_tracks_guards() {
        let cell = Value::new("a");
        assert_eq!(cell.current_readers(), 0);
        let g1 = cell.load();
        let g2 = cell.load();
        assert_eq!(cell.current_readers(), 2);
        drop(g1);
        assert_eq!(cell.current_readers(), 1);
        drop(g2);
        assert_eq!(cell.current_readers(), 0);
    }

    #[test]
    fn test_update_blocks_on_held_reader() {
        let cell = Value::new(1u32);
        let guard = cell.load();
        let err = cell.update(2, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, UpstreamError::RcuBlocked));
        // new value is active despite the block
        assert_eq!(*cell.load(), 2);
        drop(guard);
    }

    #[test]
    fn test_update_drains_after_release() {
        let cell = Arc::new(Value::new(1u32));
        let guard = cell.load();

        let writer = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.update(2, Duration::from_secs(2)))
        };
        thread::sleep(Duration::from_millis(20));
        drop(guard);
        writer.join().unwrap().unwrap();
        assert_eq!(*cell.load(), 2);
    }

    #[test]
    fn test_old_generation_remains_readable() {
        let cell = Value::new(vec![1, 2]);
        let old = cell.load();
        let _ = cell.update(vec![1, 2, 3], Duration::from_millis(5));
        // the pinned guard still sees the generation it loaded
        assert_eq!(*old, vec![1, 2]);
        assert_eq!(*cell.load(), vec![1, 2, 3]);
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let cell = Arc::new(Value::new(0usize));
        let mut readers = vec![];
        for _ in 0..4 {
            let cell = Arc::clone(&cell);
            readers.push(thread::spawn(move || {
                for _ in 0..2000 {
                    let guard = cell.load();
                    // value only moves forward
                    let _ = *guard;
                }
            }));
        }
        for i in 1..=100 {
            let _ = cell.update(i, Duration::from_millis(50));
        }
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(*cell.load(), 100);
    }
}

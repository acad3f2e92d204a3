//! Thread-safe mailbox of callbacks for the control thread.

use std::fmt;
use std::sync::Mutex;

type Message = Box<dyn FnOnce() + Send>;

/// Callbacks enqueued from any thread and run later on whichever thread drains the queue.
///
/// Draining takes the whole pending list, releases the lock and only then runs the callbacks,
/// so a callback may enqueue more work without deadlocking. Work enqueued during a drain runs
/// in the same [`process_messages`](Self::process_messages) call.
#[derive(Default)]
pub struct ControlMessageQueue {
    pending: Mutex<Vec<Message>>,
}

impl ControlMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue<F>(&self, message: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.lock().push(Box::new(message));
    }

    pub fn has_messages(&self) -> bool {
        !self.lock().is_empty()
    }

    /// Run every pending callback, including ones enqueued while draining. Returns how many ran.
    pub fn process_messages(&self) -> usize {
        let mut processed = 0;
        loop {
            let batch = std::mem::take(&mut *self.lock());
            if batch.is_empty() {
                return processed;
            }
            processed += batch.len();
            for message in batch {
                message();
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Message>> {
        // callbacks never run under the lock
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for ControlMessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlMessageQueue")
            .field("pending", &self.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_in_enqueue_order() {
        let queue = ControlMessageQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            queue.enqueue(move || log.lock().unwrap().push(i));
        }
        assert!(queue.has_messages());
        assert_eq!(queue.process_messages(), 3);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert!(!queue.has_messages());
    }

    #[test]
    fn reentrant_enqueue_runs_in_the_same_drain() {
        let queue = Arc::new(ControlMessageQueue::new());
        let ran = Arc::new(AtomicUsize::new(0));

        let inner_queue = queue.clone();
        let inner_ran = ran.clone();
        queue.enqueue(move || {
            inner_ran.fetch_add(1, Ordering::Relaxed);
            let ran = inner_ran.clone();
            inner_queue.enqueue(move || {
                ran.fetch_add(1, Ordering::Relaxed);
            });
        });

        assert_eq!(queue.process_messages(), 2);
        assert_eq!(ran.load(Ordering::Relaxed), 2);
        assert_eq!(queue.process_messages(), 0);
    }
}

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use platewatch_common::frame::Frame;
use tokio::sync::Mutex;
use tracing::trace;

/// Serialises frame-pair jobs for one stateful filter.
///
/// Each job is run with the frame admitted just before it (`None` for the
/// first job) and its own input frame. Jobs run one at a time, in the order
/// `enqueue` was first polled.
///
/// Admission goes through a FIFO-fair async mutex: waiters are parked in a
/// queue and woken one by one as the running job finishes, so there is no
/// polling. The mutex also guards the stored prior frame, which makes
/// "take prior, store copy of current" a single step with respect to every
/// other job of this queue.
///
/// A job that fails, panics, or whose caller is dropped still releases the
/// queue; the prior frame has already advanced to its input by then.
pub struct OrderedFrameQueue<F = Frame> {
    prior: Mutex<Option<F>>,
    waiting: AtomicUsize,
}

impl<F: Clone> OrderedFrameQueue<F> {
    pub fn new() -> Self {
        Self {
            prior: Mutex::new(None),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Run `job(prior, frame)` once every earlier job has completed, and
    /// return its output.
    ///
    /// The stored prior is replaced with a copy of `frame` before the job
    /// starts; it is never mutated in place, so a previous job still holding
    /// its own `prior` is unaffected.
    pub async fn enqueue<J, Fut, R>(&self, frame: F, job: J) -> R
    where
        J: FnOnce(Option<F>, F) -> Fut,
        Fut: Future<Output = R>,
    {
        let mut slot = {
            let _waiting = WaitingGuard::enter(&self.waiting);
            self.prior.lock().await
        };

        let prior = slot.replace(frame.clone());
        let output = job(prior, frame).await;
        drop(slot);
        output
    }

    /// Number of jobs waiting for admission (not counting the running one).
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    /// Forget the stored prior frame; the next job starts fresh.
    pub async fn reset(&self) {
        *self.prior.lock().await = None;
    }
}

/// Counts a job as waiting until admitted or dropped.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let waiting = counter.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(waiting, "job queued");
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl<F: Clone> Default for OrderedFrameQueue<F> {
    fn default() -> Self {
        Self::new()
    }
}

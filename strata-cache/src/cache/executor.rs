//! Serial execution context and timers
//!
//! A `SerialExecutor` owns a piece of state on a dedicated thread and runs
//! submitted jobs against it strictly in submission order. Jobs are queued at
//! call time, so the order callers observe is the order they called in, even
//! when the returned `Completion` is awaited later or never.

use crate::core::{CacheError, Result};
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Single-threaded, strictly ordered job queue owning a state value
pub struct SerialExecutor<S> {
    tx: mpsc::UnboundedSender<Job<S>>,
}

impl<S: Send + 'static> SerialExecutor<S> {
    /// Spawn the worker thread; it exits once every handle is dropped and the
    /// queue is drained
    pub fn spawn(name: &str, mut state: S) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job<S>>();
        let thread_name = name.to_string();

        std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    if catch_unwind(AssertUnwindSafe(|| job(&mut state))).is_err() {
                        error!("Job panicked on executor {}", thread_name);
                    }
                }
                debug!("Executor {} terminated", thread_name);
            })?;

        Ok(Self { tx })
    }

    /// Queue a job without waiting for it; returns false if the worker is gone
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.tx.send(Box::new(job)).is_ok()
    }

    /// Queue a job and get a handle to its result
    pub fn submit<T, F>(&self, job: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let queued = self.execute(move |state| {
            let _ = tx.send(job(state));
        });
        if !queued {
            warn!("{}", CacheError::WorkerStopped);
        }
        Completion { rx }
    }
}

/// Pending result of a queued job
///
/// Await it from async code or call [`Completion::wait`] from a plain thread.
/// Dropping it does not cancel the job. If the worker dies before answering,
/// the result is `T::default()`: `false`, `None` or zero.
#[must_use = "the job runs regardless; drop explicitly to ignore its result"]
pub struct Completion<T> {
    rx: oneshot::Receiver<T>,
}

impl<T: Default> Completion<T> {
    /// Block the current thread until the job finishes
    ///
    /// Must not be called from inside an async task; await the completion instead.
    pub fn wait(self) -> T {
        self.rx.blocking_recv().unwrap_or_else(|_| {
            warn!("{}", CacheError::WorkerStopped);
            T::default()
        })
    }
}

impl<T: Default> Future for Completion<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                warn!("{}", CacheError::WorkerStopped);
                T::default()
            })
        })
    }
}

/// Periodic timer on its own thread
///
/// `tick` returns the delay until the next tick, or `None` to stop. Dropping
/// the ticker stops it at the next wake-up without joining, so a tick may
/// safely drop the last owner of the ticker.
pub struct Ticker {
    shared: Arc<(Mutex<TickerState>, Condvar)>,
}

#[derive(Default)]
struct TickerState {
    stopped: bool,
    rescheduled: Option<Duration>,
}

impl Ticker {
    pub fn spawn<F>(name: &str, first: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let shared = Arc::new((Mutex::new(TickerState::default()), Condvar::new()));
        let signal = Arc::clone(&shared);

        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut delay = first;
                loop {
                    {
                        let (lock, cvar) = &*signal;
                        let mut state = lock.lock();
                        // `None` when the delay overflows: sleep until woken
                        let mut deadline = Instant::now().checked_add(delay);
                        loop {
                            if state.stopped {
                                break;
                            }
                            if let Some(next) = state.rescheduled.take() {
                                deadline = Instant::now().checked_add(next);
                                continue;
                            }
                            match deadline {
                                Some(at) if Instant::now() >= at => break,
                                Some(at) => {
                                    cvar.wait_until(&mut state, at);
                                }
                                None => cvar.wait(&mut state),
                            }
                        }
                        if state.stopped {
                            break;
                        }
                    }
                    match tick() {
                        Some(next) => delay = next,
                        None => break,
                    }
                }
            })?;

        Ok(Self { shared })
    }

    /// Restart the current wait so the next tick comes `delay` from now
    pub fn reschedule(&self, delay: Duration) {
        let (lock, cvar) = &*self.shared;
        lock.lock().rescheduled = Some(delay);
        cvar.notify_all();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.shared;
        lock.lock().stopped = true;
        cvar.notify_all();
    }
}

//! Asynchronous I/O pipeline.
//!
//! Work is modeled as a tree of [`Io`] handles.  An `Io` executes its work
//! only after it has been dispatched *and* all of its children have
//! completed; completion then propagates upward.  This is the mechanism the
//! buffer cache uses to pipeline an indirect block's write downstream of its
//! children's writes, and to defer a prepared write until a resolving read
//! finishes.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tephra_error::{Result, TephraError};
use tracing::{debug, trace};

/// Scheduling class recorded in trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPriority {
    SyncRead,
    AsyncRead,
    AsyncWrite,
    Prefetch,
}

type Work = Box<dyn FnOnce() -> Result<()> + Send>;

/// Pipeline worker-pool configuration.
#[derive(Debug, Clone, Copy)]
pub struct IoConfig {
    /// Number of worker threads.
    pub workers: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

impl IoConfig {
    pub fn validate(self) -> Result<Self> {
        if self.workers == 0 {
            return Err(TephraError::Format(
                "io pipeline requires at least one worker".to_owned(),
            ));
        }
        Ok(self)
    }
}

struct ExecShared {
    queue: Mutex<VecDeque<(IoPriority, Work)>>,
    wake: Condvar,
    stop: AtomicBool,
}

/// Worker pool executing pipeline stages.
///
/// Dropping the executor drains the queue and joins the workers.
pub struct IoExecutor {
    shared: Arc<ExecShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for IoExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoExecutor")
            .field("queued", &self.shared.queue.lock().len())
            .finish()
    }
}

impl IoExecutor {
    pub fn new(config: IoConfig) -> Result<Arc<Self>> {
        let config = config.validate()?;
        let shared = Arc::new(ExecShared {
            queue: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            stop: AtomicBool::new(false),
        });
        let mut workers = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let shared = Arc::clone(&shared);
            workers.push(thread::spawn(move || Self::worker_loop(&shared, worker_id)));
        }
        Ok(Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
        }))
    }

    fn worker_loop(shared: &ExecShared, worker_id: usize) {
        loop {
            let next = {
                let mut queue = shared.queue.lock();
                loop {
                    if let Some(entry) = queue.pop_front() {
                        break Some(entry);
                    }
                    if shared.stop.load(Ordering::Acquire) {
                        break None;
                    }
                    shared.wake.wait(&mut queue);
                }
            };
            let Some((priority, work)) = next else {
                trace!(target: "tephra::io", event = "worker_exit", worker = worker_id);
                return;
            };
            trace!(
                target: "tephra::io",
                event = "work_start",
                worker = worker_id,
                priority = ?priority
            );
            // Errors are reported through the Io completion chain; the
            // return value here is only for tracing.
            if let Err(err) = work() {
                debug!(
                    target: "tephra::io",
                    event = "work_failed",
                    worker = worker_id,
                    error = %err
                );
            }
        }
    }

    /// Returns false if the pipeline has begun shutting down and the work
    /// was not accepted.
    fn enqueue(&self, priority: IoPriority, work: Work) -> bool {
        if self.shared.stop.load(Ordering::Acquire) {
            return false;
        }
        let mut queue = self.shared.queue.lock();
        queue.push_back((priority, work));
        drop(queue);
        self.shared.wake.notify_one();
        true
    }

    /// Request shutdown and join all workers.  Remaining queued work is
    /// completed first.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for IoExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct IoState {
    pending_children: usize,
    dispatched: bool,
    work: Option<Work>,
    work_queued: bool,
    done: bool,
    /// First failure observed by this io or any child.
    failure: Option<String>,
    parent: Option<Io>,
}

struct IoInner {
    state: Mutex<IoState>,
    changed: Condvar,
    executor: Arc<IoExecutor>,
    priority: IoPriority,
}

/// Handle on one node of the I/O tree.  Cheap to clone.
#[derive(Clone)]
pub struct Io {
    inner: Arc<IoInner>,
}

impl std::fmt::Debug for Io {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Io")
            .field("priority", &self.inner.priority)
            .field("pending_children", &state.pending_children)
            .field("dispatched", &state.dispatched)
            .field("done", &state.done)
            .finish()
    }
}

impl Io {
    /// A barrier io with no work of its own: completes once dispatched and
    /// all children have completed.
    #[must_use]
    pub fn root(executor: &Arc<IoExecutor>) -> Self {
        Self::new(executor, IoPriority::SyncRead, None, None)
    }

    /// An io with work, optionally pipelined under `parent`.
    #[must_use]
    pub fn with_work(
        executor: &Arc<IoExecutor>,
        priority: IoPriority,
        parent: Option<&Io>,
        work: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Self {
        Self::new(executor, priority, parent, Some(Box::new(work)))
    }

    fn new(executor: &Arc<IoExecutor>, priority: IoPriority, parent: Option<&Io>, work: Option<Work>) -> Self {
        if let Some(parent) = parent {
            parent.inner.state.lock().pending_children += 1;
        }
        Self {
            inner: Arc::new(IoInner {
                state: Mutex::new(IoState {
                    pending_children: 0,
                    dispatched: false,
                    work,
                    work_queued: false,
                    done: false,
                    failure: None,
                    parent: parent.cloned(),
                }),
                changed: Condvar::new(),
                executor: Arc::clone(executor),
                priority,
            }),
        }
    }

    /// Allow this io to execute once its children finish.  Idempotent.
    pub fn dispatch(&self) {
        let mut state = self.inner.state.lock();
        if state.dispatched {
            return;
        }
        state.dispatched = true;
        self.advance(state);
    }

    /// Dispatch and block until completion.
    pub fn wait(&self) -> Result<()> {
        self.dispatch();
        let mut state = self.inner.state.lock();
        while !state.done {
            self.inner.changed.wait(&mut state);
        }
        match &state.failure {
            None => Ok(()),
            Some(message) => Err(TephraError::Format(format!("io failed: {message}"))),
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().done
    }

    /// Mark failure without running work (used when a stage cannot even be
    /// scheduled).
    pub fn fail(&self, message: String) {
        let state = self.inner.state.lock();
        self.complete_locked(state, Some(message));
    }

    fn advance(&self, mut state: parking_lot::MutexGuard<'_, IoState>) {
        if state.done || !state.dispatched || state.pending_children > 0 {
            return;
        }
        if let Some(work) = state.work.take() {
            state.work_queued = true;
            let io = self.clone();
            let priority = self.inner.priority;
            drop(state);
            let accepted = self.inner.executor.enqueue(
                priority,
                Box::new(move || {
                    let result = work();
                    let failure = result.as_ref().err().map(ToString::to_string);
                    let state = io.inner.state.lock();
                    io.complete_locked(state, failure);
                    result
                }),
            );
            if !accepted {
                let state = self.inner.state.lock();
                self.complete_locked(state, Some("io pipeline shut down".to_owned()));
            }
        } else if !state.work_queued {
            // Barrier io: nothing left to run.
            self.complete_locked(state, None);
        }
    }

    fn complete_locked(
        &self,
        mut state: parking_lot::MutexGuard<'_, IoState>,
        failure: Option<String>,
    ) {
        if state.done {
            return;
        }
        state.done = true;
        if state.failure.is_none() {
            state.failure = failure;
        }
        let parent = state.parent.take();
        let child_failure = state.failure.clone();
        drop(state);
        self.inner.changed.notify_all();
        if let Some(parent) = parent {
            parent.child_done(child_failure);
        }
    }

    fn child_done(&self, failure: Option<String>) {
        let mut state = self.inner.state.lock();
        debug_assert!(state.pending_children > 0);
        state.pending_children -= 1;
        if state.failure.is_none() {
            state.failure = failure;
        }
        self.advance(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn executor() -> Arc<IoExecutor> {
        IoExecutor::new(IoConfig::default()).unwrap()
    }

    #[test]
    fn config_rejects_zero_workers() {
        assert!(IoConfig { workers: 0 }.validate().is_err());
    }

    #[test]
    fn root_io_completes_after_children() {
        let exec = executor();
        let root = Io::root(&exec);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let ran = Arc::clone(&ran);
            let child = Io::with_work(&exec, IoPriority::AsyncRead, Some(&root), move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            child.dispatch();
        }
        root.wait().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn parent_work_runs_after_child_work() {
        let exec = executor();
        let order = Arc::new(Mutex::new(Vec::new()));
        let parent = {
            let order = Arc::clone(&order);
            Io::with_work(&exec, IoPriority::AsyncWrite, None, move || {
                order.lock().push("parent");
                Ok(())
            })
        };
        let child = {
            let order = Arc::clone(&order);
            Io::with_work(&exec, IoPriority::AsyncWrite, Some(&parent), move || {
                // Give the parent a chance to jump the queue if the
                // pipeline were broken.
                thread::sleep(Duration::from_millis(20));
                order.lock().push("child");
                Ok(())
            })
        };
        parent.dispatch();
        child.dispatch();
        parent.wait().unwrap();
        assert_eq!(*order.lock(), vec!["child", "parent"]);
    }

    #[test]
    fn child_failure_propagates_to_waiter() {
        let exec = executor();
        let root = Io::root(&exec);
        let child = Io::with_work(&exec, IoPriority::AsyncRead, Some(&root), || {
            Err(TephraError::ReadFailed)
        });
        child.dispatch();
        assert!(root.wait().is_err());
    }

    #[test]
    fn deferred_dispatch_holds_parent_open() {
        let exec = executor();
        let parent = Io::root(&exec);
        let child = Io::with_work(&exec, IoPriority::AsyncWrite, Some(&parent), || Ok(()));
        parent.dispatch();
        assert!(!parent.is_done());
        child.dispatch();
        parent.wait().unwrap();
    }
}

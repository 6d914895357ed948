//! Owner-thread discipline
//!
//! A VM and its bridge belong to the thread that created them. Public entry
//! points assert this in debug builds. Work produced on other threads is
//! posted to a bounded [`TaskQueue`] and runs on the owner thread, a
//! time-bounded slice per tick.

use std::fmt;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use crate::bridge::Bridge;
use crate::error::ScriptError;
use crate::vm::{ScriptState, StackGuard};

/// Thread that owns a VM instance
#[derive(Debug, Clone, Copy)]
pub struct OwnerThread {
    id: ThreadId,
}

impl OwnerThread {
    /// Bind to the calling thread
    pub fn current() -> Self {
        Self {
            id: thread::current().id(),
        }
    }

    /// Whether the calling thread is the owner
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.id
    }

    /// Debug-build assertion that the calling thread is the owner
    #[inline]
    pub fn assert_owner(&self) {
        debug_assert!(
            self.is_current(),
            "VM accessed from {:?}, owned by {:?}",
            thread::current().id(),
            self.id
        );
    }
}

/// Work to run on the owner thread
pub type Task = Box<dyn FnOnce(&mut ScriptState, &Bridge) -> Result<(), ScriptError> + Send>;

/// Failure to post a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The queue is at capacity
    #[error("task queue is full")]
    Full,
    /// The owning runtime was dropped
    #[error("task queue is closed")]
    Disconnected,
}

/// Sending half of a [`TaskQueue`]. Cheap to clone and `Send`.
#[derive(Clone)]
pub struct TaskSender {
    tx: Sender<Task>,
}

impl TaskSender {
    /// Post a task without blocking
    pub fn post<F>(&self, task: F) -> Result<(), TaskError>
    where
        F: FnOnce(&mut ScriptState, &Bridge) -> Result<(), ScriptError> + Send + 'static,
    {
        self.tx.try_send(Box::new(task)).map_err(|err| match err {
            TrySendError::Full(_) => TaskError::Full,
            TrySendError::Disconnected(_) => TaskError::Disconnected,
        })
    }
}

impl fmt::Debug for TaskSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSender").field("queued", &self.tx.len()).finish()
    }
}

/// Bounded queue of tasks for the owner thread
pub struct TaskQueue {
    tx: Sender<Task>,
    rx: Receiver<Task>,
}

impl TaskQueue {
    /// Queue holding at most `capacity` pending tasks
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity);
        Self { tx, rx }
    }

    /// New sending half
    pub fn sender(&self) -> TaskSender {
        TaskSender { tx: self.tx.clone() }
    }

    /// Number of pending tasks
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether no task is pending
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Run pending tasks until the queue is empty or `budget` has elapsed.
    ///
    /// At least one task runs per call when any is pending. Task errors are
    /// logged. Returns the number of tasks run.
    pub fn drain(&self, vm: &mut ScriptState, bridge: &Bridge, budget: Duration) -> usize {
        let start = Instant::now();
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            let mut guard = StackGuard::new(&mut *vm);
            if let Err(err) = task(&mut *guard, bridge) {
                log::error!("task failed: {}\n{}", err.message, err.traceback);
            }
            drop(guard);
            ran += 1;
            if start.elapsed() >= budget {
                break;
            }
        }
        if !self.rx.is_empty() {
            log::debug!("tick budget spent after {} tasks, {} left", ran, self.rx.len());
        }
        ran
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.len())
            .field("capacity", &self.tx.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeOptions;
    use crate::host::TypeDomain;
    use crate::vm::ScriptValue;
    use std::rc::Rc;

    fn fixture() -> (ScriptState, Rc<Bridge>) {
        (
            ScriptState::new(),
            Bridge::new(Rc::new(TypeDomain::new()), BridgeOptions::default()),
        )
    }

    #[test]
    fn test_tasks_posted_from_other_thread_run_on_drain() {
        let (mut vm, bridge) = fixture();
        let queue = TaskQueue::new(8);
        let sender = queue.sender();
        thread::spawn(move || {
            for i in 0..3 {
                sender
                    .post(move |vm, _| {
                        let n = vm.get_global("sum").as_number().unwrap_or(0.0);
                        vm.set_global("sum", n + f64::from(i));
                        Ok(())
                    })
                    .unwrap();
            }
        })
        .join()
        .unwrap();
        assert_eq!(queue.drain(&mut vm, &bridge, Duration::from_secs(1)), 3);
        assert_eq!(vm.get_global("sum"), ScriptValue::Number(3.0));
    }

    #[test]
    fn test_bounded_queue_rejects_overflow() {
        let queue = TaskQueue::new(1);
        let sender = queue.sender();
        sender.post(|_, _| Ok(())).unwrap();
        assert_eq!(sender.post(|_, _| Ok(())), Err(TaskError::Full));
        drop(queue);
        assert_eq!(sender.post(|_, _| Ok(())), Err(TaskError::Disconnected));
    }

    #[test]
    fn test_zero_budget_runs_one_task_per_tick() {
        let (mut vm, bridge) = fixture();
        let queue = TaskQueue::new(4);
        let sender = queue.sender();
        for _ in 0..3 {
            sender.post(|_, _| Ok(())).unwrap();
        }
        assert_eq!(queue.drain(&mut vm, &bridge, Duration::ZERO), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_failing_task_does_not_stop_drain() {
        let (mut vm, bridge) = fixture();
        let queue = TaskQueue::new(4);
        let sender = queue.sender();
        sender.post(|vm, _| Err(vm.error("boom"))).unwrap();
        sender
            .post(|vm, _| {
                vm.set_global("ran", true);
                Ok(())
            })
            .unwrap();
        assert_eq!(queue.drain(&mut vm, &bridge, Duration::from_secs(1)), 2);
        assert_eq!(vm.get_global("ran"), ScriptValue::Bool(true));
    }

    #[test]
    fn test_owner_thread() {
        let owner = OwnerThread::current();
        assert!(owner.is_current());
        let other = thread::spawn(move || owner.is_current()).join().unwrap();
        assert!(!other);
    }
}

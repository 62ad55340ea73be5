//! Priority-based scheduling of asynchronous tasks
//!
//! A task is a factory of streams: it can be started, interrupted, then
//! started again from scratch. Lower numbers mean higher priorities.
//!
//! - A new task starts right away if its priority is at least as high as
//!   the highest priority currently running, otherwise it waits.
//! - Starting a task whose priority is `<= high` interrupts every running
//!   task whose priority is `>= low`. Interrupted tasks go back to waiting.
//! - When a running task ends, every waiting task with a priority at least as
//!   high as both the remaining running ones and the other waiting ones
//!   starts. Waiting tasks of equal priority start in creation order.

use crate::config::PrioritizerConfig;
use crate::error::{Error, Result};
use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Builds the work of a task, once per start
pub type TaskFactory<T> = Arc<dyn Fn() -> BoxStream<'static, Result<T>> + Send + Sync>;

/// Identifier of a task, stable across interruptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

/// Events of a prioritized task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrioritizerEvent<T> {
    /// Item produced by the task's work
    Data(T),
    /// The task went back to waiting, its work will start again from scratch
    Interrupted,
    /// The work completed
    Ended,
}

type EventSender<T> = mpsc::UnboundedSender<Result<PrioritizerEvent<T>>>;

struct Task<T> {
    id: TaskId,
    priority: i32,
    factory: TaskFactory<T>,
    events: EventSender<T>,
}

struct RunningTask<T> {
    task: Task<T>,
    run_id: u64,
    interrupt: CancellationToken,
}

struct State<T> {
    this: Weak<Mutex<State<T>>>,
    steps: PrioritizerConfig,
    /// Highest priority (lowest number) among running tasks
    min_running_priority: Option<i32>,
    waiting: Vec<Task<T>>,
    running: Vec<RunningTask<T>>,
    next_id: u64,
}

/// Schedules tasks according to their priority.
///
/// Cloning gives another handle on the same scheduler. Tasks are driven by
/// tokio tasks, so it must be used from within a runtime.
pub struct Prioritizer<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Prioritizer<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Send + 'static> Prioritizer<T> {
    pub fn new(steps: PrioritizerConfig) -> Result<Self> {
        if steps.high >= steps.low {
            return Err(Error::InvalidConfig(
                "the high priority step must be lower than the low priority step".into(),
            ));
        }
        let state = Arc::new_cyclic(|this| {
            Mutex::new(State {
                this: this.clone(),
                steps,
                min_running_priority: None,
                waiting: Vec::new(),
                running: Vec::new(),
                next_id: 0,
            })
        });
        Ok(Self { state })
    }

    /// Schedule a task. Dropping the returned handle cancels it.
    pub fn create<F>(&self, factory: F, priority: i32) -> PrioritizedTask<T>
    where
        F: Fn() -> BoxStream<'static, Result<T>> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let id = TaskId(state.next_id);
        state.next_id += 1;

        let task = Task {
            id,
            priority,
            factory: Arc::new(factory),
            events: tx,
        };
        if state.can_start_now(priority) {
            state.start(task);
            if state.is_running_high_priority() {
                state.interrupt_cancellable_tasks();
            }
        } else {
            debug!(priority, "Fetchers: Task waiting for its turn");
            state.waiting.push(task);
        }

        PrioritizedTask {
            id,
            events: rx,
            state: Arc::downgrade(&self.state),
        }
    }

    /// Change the priority of a task still waiting for its turn.
    ///
    /// Running tasks keep the priority they were started with.
    pub fn update_priority(&self, id: TaskId, priority: i32) {
        let mut state = self.state.lock();
        if let Some(index) = state.waiting.iter().position(|t| t.id == id) {
            if state.waiting[index].priority == priority {
                return;
            }
            state.waiting[index].priority = priority;
            if !state.can_start_now(priority) {
                return;
            }
            let task = state.waiting.remove(index);
            state.start(task);
            if state.is_running_high_priority() {
                state.interrupt_cancellable_tasks();
            }
            return;
        }

        if state.running.iter().any(|r| r.task.id == id) {
            debug!(?id, "Fetchers: Ignoring priority update of a running task");
        } else {
            warn!(?id, "Fetchers: Priority update of a non-existent task");
        }
    }

    /// Number of waiting and running tasks
    pub fn counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.waiting.len(), state.running.len())
    }
}

impl<T: Send + 'static> State<T> {
    fn can_start_now(&self, priority: i32) -> bool {
        self.min_running_priority
            .map_or(true, |min_running| priority <= min_running)
    }

    fn is_running_high_priority(&self) -> bool {
        self.min_running_priority
            .is_some_and(|min_running| min_running <= self.steps.high)
    }

    fn refresh_min_running_priority(&mut self) {
        self.min_running_priority = self.running.iter().map(|r| r.task.priority).min();
    }

    fn start(&mut self, task: Task<T>) {
        self.min_running_priority = Some(
            self.min_running_priority
                .map_or(task.priority, |min| min.min(task.priority)),
        );

        let run_id = self.next_id;
        self.next_id += 1;
        let interrupt = CancellationToken::new();

        tokio::spawn(drive(
            self.this.clone(),
            run_id,
            task.factory.clone(),
            task.events.clone(),
            interrupt.clone(),
        ));

        self.running.push(RunningTask {
            task,
            run_id,
            interrupt,
        });
    }

    fn interrupt_cancellable_tasks(&mut self) {
        let low = self.steps.low;
        while let Some(index) = self.running.iter().position(|r| r.task.priority >= low) {
            let RunningTask {
                task, interrupt, ..
            } = self.running.remove(index);
            debug!(priority = task.priority, "Fetchers: Interrupting task");
            interrupt.cancel();
            let _ = task.events.send(Ok(PrioritizerEvent::Interrupted));
            self.waiting.push(task);
        }
        self.refresh_min_running_priority();
    }

    /// Start every waiting task that now has the highest priority
    fn loop_through_waiting_queue(&mut self) {
        let Some(min_waiting) = self.waiting.iter().map(|t| t.priority).min() else {
            return;
        };
        if self
            .min_running_priority
            .is_some_and(|min_running| min_running < min_waiting)
        {
            return;
        }

        let threshold = self
            .min_running_priority
            .map_or(min_waiting, |min_running| min_running.min(min_waiting));
        let mut index = 0;
        while index < self.waiting.len() {
            if self.waiting[index].priority <= threshold {
                let task = self.waiting.remove(index);
                self.start(task);
            } else {
                index += 1;
            }
        }

        if self.is_running_high_priority() {
            self.interrupt_cancellable_tasks();
        }
    }

    fn on_task_end(&mut self, run_id: u64) {
        let Some(index) = self.running.iter().position(|r| r.run_id == run_id) else {
            // Interrupted or cancelled in the meantime
            return;
        };
        self.running.remove(index);
        self.refresh_min_running_priority();
        self.loop_through_waiting_queue();
    }

    fn cancel(&mut self, id: TaskId) {
        if let Some(index) = self.waiting.iter().position(|t| t.id == id) {
            self.waiting.remove(index);
            return;
        }
        let Some(index) = self.running.iter().position(|r| r.task.id == id) else {
            return;
        };
        let running = self.running.remove(index);
        running.interrupt.cancel();
        self.refresh_min_running_priority();
        self.loop_through_waiting_queue();
    }
}

/// Run one start of a task, forwarding its items until it ends or is
/// interrupted
async fn drive<T: Send + 'static>(
    state: Weak<Mutex<State<T>>>,
    run_id: u64,
    factory: TaskFactory<T>,
    events: EventSender<T>,
    interrupt: CancellationToken,
) {
    let mut work = factory();
    let outcome = loop {
        let item = tokio::select! {
            biased;
            _ = interrupt.cancelled() => return,
            item = work.next() => item,
        };
        match item {
            Some(Ok(value)) => {
                let _ = events.send(Ok(PrioritizerEvent::Data(value)));
            }
            Some(Err(err)) => break Err(err),
            None => break Ok(()),
        }
    };
    drop(work);

    let Some(state) = state.upgrade() else {
        return;
    };
    let mut state = state.lock();
    if interrupt.is_cancelled() {
        return;
    }
    let _ = events.send(match outcome {
        Ok(()) => Ok(PrioritizerEvent::Ended),
        Err(err) => Err(err),
    });
    state.on_task_end(run_id);
}

/// Handle on a scheduled task, streaming its events.
///
/// The stream ends after [`PrioritizerEvent::Ended`] or an error. Dropping
/// the handle cancels the task.
pub struct PrioritizedTask<T: Send + 'static> {
    id: TaskId,
    events: mpsc::UnboundedReceiver<Result<PrioritizerEvent<T>>>,
    state: Weak<Mutex<State<T>>>,
}

impl<T: Send + 'static> PrioritizedTask<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl<T: Send + 'static> Stream for PrioritizedTask<T> {
    type Item = Result<PrioritizerEvent<T>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl<T: Send + 'static> Drop for PrioritizedTask<T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state.lock().cancel(self.id);
        }
    }
}

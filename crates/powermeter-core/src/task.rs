//! Supervised concurrent tasks
//!
//! A [`Task`] pairs a [`TaskConfig`] (the FreeRTOS-style name, priority,
//! stack size and core affinity) with an async body. [`Task::run`] is the
//! supervisor: it races the body against cancellation, logs any error that
//! escapes the body and cancels the task instead of taking the process down.
//!
//! Cancellation is cooperative: [`TaskHandle::cancel`] takes effect the next
//! time the body awaits. Cancelling a task while it holds a
//! [`ValueMutex`](crate::sync::ValueMutex) guard releases the guard, since
//! the body's future is dropped.

use alloc::sync::Arc;
use core::future::Future;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use log::{error, info};

use crate::error::Result;

/// FreeRTOS task names are limited to 16 characters.
pub const TASK_NAME_LEN: usize = 16;

pub type TaskName = heapless::String<TASK_NAME_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuCore {
    Core0,
    Core1,
    /// Let the scheduler pick.
    #[default]
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    pub name: TaskName,
    pub priority: u8,
    /// Stack budget in bytes.
    pub stack_size: usize,
    pub core: CpuCore,
}

impl TaskConfig {
    pub const DEFAULT_PRIORITY: u8 = 1;
    pub const DEFAULT_STACK_SIZE: usize = 32 * 1024;

    /// Names longer than [`TASK_NAME_LEN`] are truncated.
    pub fn new(name: &str) -> Self {
        let mut truncated = TaskName::new();
        for c in name.chars() {
            if truncated.push(c).is_err() {
                break;
            }
        }

        Self {
            name: truncated,
            priority: Self::DEFAULT_PRIORITY,
            stack_size: Self::DEFAULT_STACK_SIZE,
            core: CpuCore::Any,
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn pinned_to(mut self, core: CpuCore) -> Self {
        self.core = core;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Pending = 0,
    Running = 1,
    Finished = 2,
    Failed = 3,
    Cancelled = 4,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Finished,
            3 => Self::Failed,
            _ => Self::Cancelled,
        }
    }

    pub fn is_done(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }
}

struct Shared {
    name: TaskName,
    state: AtomicU8,
    cancelled: AtomicBool,
    cancel: Signal<CriticalSectionRawMutex, ()>,
}

/// Cloneable reference to a task, usable from inside and outside of it.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<Shared>,
}

impl TaskHandle {
    fn new(name: TaskName) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                state: AtomicU8::new(TaskState::Pending as u8),
                cancelled: AtomicBool::new(false),
                cancel: Signal::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.shared.name.as_str()
    }

    /// Request cancellation. Calling this more than once, or after the task
    /// ended, has no further effect.
    pub fn cancel(&self) {
        if !self.shared.cancelled.swap(true, Ordering::AcqRel) {
            self.shared.cancel.signal(());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.shared.state.store(state as u8, Ordering::Release);
    }

    async fn cancelled(&self) {
        self.shared.cancel.wait().await
    }
}

impl core::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A unit of concurrent work. `code` receives the task's own handle so the
/// body can cancel itself or check for cancellation.
pub struct Task<F> {
    config: TaskConfig,
    handle: TaskHandle,
    code: F,
}

impl<F, Fut> Task<F>
where
    F: FnOnce(TaskHandle) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    pub fn new(config: TaskConfig, code: F) -> Self {
        let handle = TaskHandle::new(config.name.clone());
        Self {
            config,
            handle,
            code,
        }
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    /// Drive the body to completion under supervision and report how it
    /// ended.
    pub async fn run(self) -> TaskState {
        let Self { config, handle, code } = self;
        let name = config.name.as_str();

        if handle.is_cancelled() {
            info!("Task {} cancelled before it started", name);
            handle.set_state(TaskState::Cancelled);
            return TaskState::Cancelled;
        }

        info!(
            "Task {} started (priority {}, core {:?})",
            name, config.priority, config.core
        );
        handle.set_state(TaskState::Running);

        let state = match select(code(handle.clone()), handle.cancelled()).await {
            Either::First(Ok(())) => {
                info!("Task {} finished", name);
                TaskState::Finished
            }
            Either::First(Err(e)) => {
                error!("Task {} failed: {}", name, e);
                handle.cancel();
                TaskState::Failed
            }
            Either::Second(()) => {
                info!("Task {} cancelled", name);
                TaskState::Cancelled
            }
        };

        handle.set_state(state);
        state
    }
}

/// Starts tasks on some execution context (a FreeRTOS task, an OS thread).
pub trait TaskSpawner {
    fn spawn<F, Fut>(&self, task: Task<F>) -> Result<TaskHandle>
    where
        F: FnOnce(TaskHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + 'static;
}

#[cfg(feature = "std")]
pub use self::thread::{StdDelay, ThreadSpawner};

#[cfg(feature = "std")]
mod thread {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::string::ToString;
    use std::time::Duration;

    use embedded_hal_async::delay::DelayNs;
    use log::{debug, error, warn};
    use thread_priority::{ThreadPriority, ThreadPriorityValue, set_current_thread_priority};

    use super::{CpuCore, Task, TaskConfig, TaskHandle, TaskSpawner, TaskState};
    use crate::error::{Error, Result};
    use core::future::Future;

    /// What [`apply_placement`] applied to the calling thread.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Placement {
        /// OS id of the core the thread is pinned to.
        pub core: Option<usize>,
        pub priority: Option<u8>,
    }

    /// Index into the host's usable cores, `None` for [`CpuCore::Any`].
    fn core_index(core: CpuCore) -> Option<usize> {
        match core {
            CpuCore::Core0 => Some(0),
            CpuCore::Core1 => Some(1),
            CpuCore::Any => None,
        }
    }

    /// Pin the calling thread to the configured core and set its priority.
    ///
    /// The host may refuse either (a single-core container, an unprivileged
    /// priority raise); that is logged and the task runs where it is.
    pub(crate) fn apply_placement(config: &TaskConfig) -> Placement {
        let mut placement = Placement::default();

        if let Some(index) = core_index(config.core) {
            let core = core_affinity::get_core_ids().and_then(|ids| ids.get(index).copied());
            match core {
                Some(core) if core_affinity::set_for_current(core) => placement.core = Some(core.id),
                Some(core) => warn!("Task {}: failed to pin to core {}", config.name, core.id),
                None => warn!("Task {}: host has no core {}", config.name, index),
            }
        }

        let priority = config.priority.min(99);
        match ThreadPriorityValue::try_from(priority) {
            Ok(value) => match set_current_thread_priority(ThreadPriority::Crossplatform(value)) {
                Ok(()) => placement.priority = Some(priority),
                Err(e) => warn!(
                    "Task {}: priority {} not applied: {:?}",
                    config.name, config.priority, e
                ),
            },
            Err(e) => warn!("Task {}: invalid priority {}: {}", config.name, priority, e),
        }

        placement
    }

    /// Runs every task on its own OS thread with a blocking executor. The
    /// thread is pinned and prioritised per its [`TaskConfig`] before the body
    /// starts; on ESP-IDF the pthread layer maps it onto a FreeRTOS task.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct ThreadSpawner;

    impl TaskSpawner for ThreadSpawner {
        fn spawn<F, Fut>(&self, task: Task<F>) -> Result<TaskHandle>
        where
            F: FnOnce(TaskHandle) -> Fut + Send + 'static,
            Fut: Future<Output = Result<()>> + 'static,
        {
            let handle = task.handle();
            let config = task.config().clone();
            debug!(
                "Spawning task {} ({} byte stack, priority {}, core {:?})",
                config.name, config.stack_size, config.priority, config.core
            );

            let supervisor = handle.clone();
            let placement = config.clone();
            std::thread::Builder::new()
                .name(config.name.as_str().to_string())
                .stack_size(config.stack_size)
                .spawn(move || {
                    let applied = apply_placement(&placement);
                    debug!("Task {} placed: {:?}", placement.name, applied);
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        embassy_futures::block_on(task.run())
                    }));
                    if outcome.is_err() {
                        error!("Task {} panicked", supervisor.name());
                        supervisor.cancel();
                        supervisor.set_state(TaskState::Failed);
                    }
                })
                .map_err(|e| Error::Spawn {
                    name: config.name.as_str().into(),
                    reason: e.to_string(),
                })?;

            Ok(handle)
        }
    }

    /// [`DelayNs`] backed by `std::thread::sleep`.
    ///
    /// The sleep blocks the thread, so each delay also yields once to give the
    /// supervisor a chance to observe cancellation.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct StdDelay;

    impl DelayNs for StdDelay {
        async fn delay_ns(&mut self, ns: u32) {
            std::thread::sleep(Duration::from_nanos(u64::from(ns)));
            embassy_futures::yield_now().await;
        }

        async fn delay_ms(&mut self, ms: u32) {
            std::thread::sleep(Duration::from_millis(u64::from(ms)));
            embassy_futures::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use core::cell::Cell;
    use embassy_futures::block_on;
    use embassy_futures::yield_now;

    #[test]
    fn test_name_is_truncated() {
        let config = TaskConfig::new("a-very-long-task-name");
        assert_eq!(config.name.as_str(), "a-very-long-task");
        assert_eq!(config.priority, TaskConfig::DEFAULT_PRIORITY);
        assert_eq!(config.core, CpuCore::Any);
    }

    #[test]
    fn test_finished_task() {
        let task = Task::new(TaskConfig::new("ok"), |_| async { Ok(()) });
        let handle = task.handle();
        assert_eq!(handle.state(), TaskState::Pending);
        assert_eq!(block_on(task.run()), TaskState::Finished);
        assert_eq!(handle.state(), TaskState::Finished);
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn test_error_is_contained_and_cancels() {
        let task = Task::new(TaskConfig::new("failing"), |_| async {
            Err(Error::InvalidData("sensor offline".into()))
        });
        let handle = task.handle();
        assert_eq!(block_on(task.run()), TaskState::Failed);
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_self_cancellation_stops_at_next_await() {
        let iterations = Cell::new(0);
        let task = Task::new(TaskConfig::new("loop"), |handle: TaskHandle| {
            let iterations = &iterations;
            async move {
                loop {
                    iterations.set(iterations.get() + 1);
                    if iterations.get() == 3 {
                        handle.cancel();
                        handle.cancel();
                    }
                    yield_now().await;
                }
            }
        });

        assert_eq!(block_on(task.run()), TaskState::Cancelled);
        assert_eq!(iterations.get(), 3);
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_pinned_thread_lands_on_its_core() {
        let cores = core_affinity::get_core_ids().unwrap_or_default();
        let config = TaskConfig::new("pinned").pinned_to(CpuCore::Core1);
        let placement = std::thread::spawn(move || thread::apply_placement(&config))
            .join()
            .unwrap();
        assert_eq!(placement.core, cores.get(1).map(|core| core.id));

        let config = TaskConfig::new("floating");
        let placement = std::thread::spawn(move || thread::apply_placement(&config))
            .join()
            .unwrap();
        assert_eq!(placement.core, None);
    }

    #[test]
    fn test_cancel_before_start() {
        let ran = Cell::new(false);
        let task = Task::new(TaskConfig::new("never"), |_| async {
            ran.set(true);
            Ok(())
        });
        task.handle().cancel();
        assert_eq!(block_on(task.run()), TaskState::Cancelled);
        assert!(!ran.get());
    }
}

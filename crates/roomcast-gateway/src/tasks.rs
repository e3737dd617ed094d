//! Recurring work bound to the lifecycle of a gateway entity.
//!
//! Tasks are keyed by `(owner, task)` where the owner is a connection id, a
//! room's [`task_owner`], or a namespace's. Each tick re-checks a liveness
//! predicate; the first time it fails the task removes itself before the
//! work function runs. Destruction paths call [`TaskManager::stop_all`] so
//! no timer outlives the entity it references.
//!
//! [`task_owner`]: crate::room::Room::task_owner

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Work run on every tick.
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Liveness predicate; a task self-removes the first time it returns false.
pub type LivenessFn = Arc<dyn Fn() -> bool + Send + Sync>;

type TaskKey = (String, String);

struct TaskEntry {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    last_run: Arc<RwLock<Option<DateTime<Utc>>>>,
}

/// Registry of recurring tasks.
pub struct TaskManager {
    tasks: Arc<RwLock<HashMap<TaskKey, TaskEntry>>>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    /// Create a new task manager.
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a recurring task keyed by `(owner, task)`.
    ///
    /// Idempotent: re-adding an existing key is a silent no-op. The first
    /// run happens one interval after registration.
    pub async fn add_task(
        &self,
        owner: &str,
        task: &str,
        interval: Duration,
        work: TaskFn,
        liveness: Option<LivenessFn>,
    ) {
        let key = (owner.to_string(), task.to_string());
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&key) {
            debug!(owner, task, "scheduled task already registered");
            return;
        }

        let cancel = CancellationToken::new();
        let last_run = Arc::new(RwLock::new(None));
        let handle = tokio::spawn(run_task(
            self.tasks.clone(),
            key.clone(),
            interval.max(Duration::from_millis(1)),
            work,
            liveness,
            cancel.clone(),
            last_run.clone(),
        ));

        tasks.insert(
            key,
            TaskEntry {
                cancel,
                handle,
                last_run,
            },
        );
    }

    /// Cancel one task. No further ticks run after this returns.
    pub async fn stop_task(&self, owner: &str, task: &str) {
        let key = (owner.to_string(), task.to_string());
        if let Some(entry) = self.tasks.write().await.remove(&key) {
            entry.cancel.cancel();
            entry.handle.abort();
            debug!(owner, task, "scheduled task stopped");
        }
    }

    /// Cancel every task belonging to `owner`. Invoked by connection, room,
    /// and namespace destruction paths.
    pub async fn stop_all(&self, owner: &str) {
        let removed: Vec<TaskEntry> = {
            let mut tasks = self.tasks.write().await;
            let keys: Vec<TaskKey> = tasks
                .keys()
                .filter(|(task_owner, _)| task_owner == owner)
                .cloned()
                .collect();
            keys.into_iter().filter_map(|key| tasks.remove(&key)).collect()
        };

        let count = removed.len();
        for entry in removed {
            entry.cancel.cancel();
            entry.handle.abort();
        }
        if count > 0 {
            debug!(owner, count, "scheduled tasks stopped");
        }
    }

    /// Whether `(owner, task)` is registered.
    pub async fn contains(&self, owner: &str, task: &str) -> bool {
        self.tasks
            .read()
            .await
            .contains_key(&(owner.to_string(), task.to_string()))
    }

    /// Timestamp of the task's most recent run.
    pub async fn last_run(&self, owner: &str, task: &str) -> Option<DateTime<Utc>> {
        let tasks = self.tasks.read().await;
        let entry = tasks.get(&(owner.to_string(), task.to_string()))?;
        let last_run = *entry.last_run.read().await;
        last_run
    }

    /// Number of registered tasks.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Whether no tasks are registered.
    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

async fn run_task(
    tasks: Arc<RwLock<HashMap<TaskKey, TaskEntry>>>,
    key: TaskKey,
    interval: Duration,
    work: TaskFn,
    liveness: Option<LivenessFn>,
    cancel: CancellationToken,
    last_run: Arc<RwLock<Option<DateTime<Utc>>>>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; consume it so the first run
    // lands one interval after registration.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let alive = liveness.as_ref().map(|check| check()).unwrap_or(true);
                if !alive {
                    debug!(owner = %key.0, task = %key.1, "liveness check failed, task removed");
                    tasks.write().await.remove(&key);
                    break;
                }

                *last_run.write().await = Some(Utc::now());
                work().await;
            }
        }
    }
}

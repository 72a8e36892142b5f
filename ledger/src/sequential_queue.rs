// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-key FIFO task queue.
//!
//! Tasks added under the same key run one at a time in insertion order.
//! Tasks under different keys run independently. A key's bookkeeping is
//! dropped once its queue drains, so unique keys do not accumulate.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::error;

type Task = BoxFuture<'static, ()>;

struct KeyState {
    tasks: VecDeque<Task>,
    /// Held while a task of this key runs.
    exec: Arc<Mutex<()>>,
    worker_running: bool,
    purgers: usize,
}

impl KeyState {
    fn new() -> Self {
        Self {
            tasks: VecDeque::new(),
            exec: Arc::new(Mutex::new(())),
            worker_running: false,
            purgers: 0,
        }
    }

    fn is_idle(&self) -> bool {
        self.tasks.is_empty() && !self.worker_running && self.purgers == 0
    }
}

type KeyMap<K> = Arc<Mutex<HashMap<K, KeyState>>>;

pub struct SequentialEventQueue<K> {
    keys: KeyMap<K>,
}

impl<K> Default for SequentialEventQueue<K> {
    fn default() -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K> SequentialEventQueue<K>
where
    K: Clone + Debug + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `task` behind every earlier task for `key` and starts a worker
    /// for the key if none is running.
    pub async fn add<F>(&self, key: K, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut keys = self.keys.lock().await;
        let state = keys.entry(key.clone()).or_insert_with(KeyState::new);
        state.tasks.push_back(task.boxed());
        if !state.worker_running {
            state.worker_running = true;
            let exec = state.exec.clone();
            tokio::spawn(run_worker(self.keys.clone(), key, exec));
        }
    }

    /// Runs and removes the oldest queued task for `key`, waiting for any
    /// in-flight task of the key first. Returns whether a task ran.
    pub async fn purge(&self, key: &K) -> bool {
        let exec = {
            let mut keys = self.keys.lock().await;
            let Some(state) = keys.get_mut(key) else {
                return false;
            };
            state.purgers += 1;
            state.exec.clone()
        };

        let _guard = exec.lock().await;
        let task = {
            let mut keys = self.keys.lock().await;
            keys.get_mut(key).and_then(|state| state.tasks.pop_front())
        };
        let ran = task.is_some();
        if let Some(task) = task {
            run_task(key, task).await;
        }

        let mut keys = self.keys.lock().await;
        if let Some(state) = keys.get_mut(key) {
            state.purgers -= 1;
            if state.is_idle() {
                keys.remove(key);
            }
        }
        ran
    }

    pub async fn is_processing(&self, key: &K) -> bool {
        self.keys
            .lock()
            .await
            .get(key)
            .map(|state| state.worker_running || state.purgers > 0)
            .unwrap_or(false)
    }

    /// Number of queued tasks for `key`, not counting a running one.
    pub async fn pending(&self, key: &K) -> usize {
        self.keys
            .lock()
            .await
            .get(key)
            .map(|state| state.tasks.len())
            .unwrap_or(0)
    }
}

async fn run_worker<K>(keys: KeyMap<K>, key: K, exec: Arc<Mutex<()>>)
where
    K: Debug + Eq + Hash,
{
    loop {
        let _guard = exec.lock().await;
        let task = {
            let mut map = keys.lock().await;
            let Some(state) = map.get_mut(&key) else {
                return;
            };
            match state.tasks.pop_front() {
                Some(task) => task,
                None => {
                    state.worker_running = false;
                    if state.is_idle() {
                        map.remove(&key);
                    }
                    return;
                }
            }
        };
        run_task(&key, task).await;
    }
}

async fn run_task<K: Debug>(key: &K, task: Task) {
    if AssertUnwindSafe(task).catch_unwind().await.is_err() {
        error!("[SequentialEventQueue] task for key {:?} panicked", key);
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Analyses currently in flight, keyed by `AnalysisContext::unique_id`.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    running: Mutex<HashMap<String, Instant>>,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `key` unless it is already running. The entry lives as long
    /// as the returned guard.
    pub fn try_register(self: &Arc<Self>, key: &str) -> Option<TaskGuard> {
        let mut running = self.lock();
        if running.contains_key(key) {
            return None;
        }
        running.insert(key.to_string(), Instant::now());
        Some(TaskGuard {
            registry: Arc::clone(self),
            key: key.to_string(),
        })
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// How long `key` has been running.
    pub fn running_for(&self, key: &str) -> Option<Duration> {
        self.lock().get(key).map(Instant::elapsed)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct TaskGuard {
    registry: Arc<TaskRegistry>,
    key: String,
}

impl TaskGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}

/// Caps concurrent analyses per repository. A limit of 0 disables the cap.
#[derive(Debug)]
pub struct RepoLimiter {
    limit: usize,
    active: Mutex<HashMap<String, usize>>,
}

impl RepoLimiter {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn try_acquire(self: &Arc<Self>, repo: &str) -> Option<RepoPermit> {
        let mut active = self.lock();
        let count = active.entry(repo.to_string()).or_default();
        if self.limit > 0 && *count >= self.limit {
            return None;
        }
        *count += 1;
        Some(RepoPermit {
            limiter: Arc::clone(self),
            repo: repo.to_string(),
        })
    }

    pub fn active(&self, repo: &str) -> usize {
        self.lock().get(repo).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct RepoPermit {
    limiter: Arc<RepoLimiter>,
    repo: String,
}

impl Drop for RepoPermit {
    fn drop(&mut self) {
        let mut active = self.limiter.lock();
        if let Some(count) = active.get_mut(&self.repo) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                active.remove(&self.repo);
            }
        }
    }
}

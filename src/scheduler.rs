/*
 * This file is part of Coolant.
 *
 * Copyright (C) 2025 Coolant contributors
 *
 * Coolant is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Coolant is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Coolant. If not, see <https://www.gnu.org/licenses/>.
 */

//! Keyed job scheduler
//!
//! At most one job exists per [`JobKey`]. Scheduling under a key that already
//! has a job replaces it atomically: the old job is signalled and the new one
//! spawned while the job table lock is held. A job that is already running
//! its task is never interrupted; it finishes, notices the cancellation and
//! exits. Runs for one key never overlap because every run holds the key's
//! FIFO run lock.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cl_core::DeviceId;
use cl_error::{CoolantError, Result};

/// How long `shutdown` waits for running jobs before aborting them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Channel name of device-wide jobs
const DEVICE_WIDE: &str = "*";

/// Identity of a job: one per (device, channel)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub device_id: DeviceId,
    pub channel: String,
}

impl JobKey {
    pub fn new(device_id: DeviceId, channel: impl Into<String>) -> Self {
        Self {
            device_id,
            channel: channel.into(),
        }
    }

    /// Key for jobs concerning a whole device
    pub fn device_wide(device_id: DeviceId) -> Self {
        Self::new(device_id, DEVICE_WIDE)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.channel)
    }
}

/// When a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Run once, as soon as the key's run lock is free
    Once,
    /// Run now and then every interval until cancelled
    Every(Duration),
}

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A job body; called once per run
pub type JobTask = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Wrap an async closure into a [`JobTask`]
pub fn task<F, Fut>(f: F) -> JobTask
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as JobFuture)
}

#[derive(Debug, Default)]
struct CancelSignal {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // notify_one keeps a permit when nobody waits yet
        self.notify.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

struct JobEntry {
    generation: u64,
    trigger: Trigger,
    cancel: Arc<CancelSignal>,
    handle: JoinHandle<()>,
}

type JobTable = Mutex<HashMap<JobKey, JobEntry>>;

/// Runs keyed one-shot and recurring jobs on a tokio runtime
pub struct JobScheduler {
    handle: Handle,
    running: AtomicBool,
    next_generation: AtomicU64,
    jobs: Arc<JobTable>,
    run_locks: Mutex<HashMap<JobKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobScheduler")
            .field("running", &self.is_running())
            .field("jobs", &self.len())
            .finish()
    }
}

impl JobScheduler {
    /// Scheduler spawning onto `handle`; call [`start`](Self::start) before scheduling
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            running: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!("Job scheduler started");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Schedule `task` under `key`, replacing whatever job the key had
    ///
    /// Never blocks on running jobs.
    pub fn schedule(&self, key: JobKey, trigger: Trigger, task: JobTask) -> Result<()> {
        if !self.is_running() {
            return Err(CoolantError::SchedulerStopped);
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = Arc::new(CancelSignal::default());
        let run_lock = self.run_lock(&key);

        let mut jobs = self.jobs.lock();
        if let Some(previous) = jobs.remove(&key) {
            debug!(job = %key, "Replacing job");
            previous.cancel.cancel();
        }
        let handle = self.handle.spawn(run_job(
            key.clone(),
            generation,
            trigger,
            task,
            cancel.clone(),
            run_lock,
            Arc::clone(&self.jobs),
        ));
        jobs.insert(
            key,
            JobEntry {
                generation,
                trigger,
                cancel,
                handle,
            },
        );
        Ok(())
    }

    /// Cancel the job of `key`; returns whether there was one
    pub fn cancel(&self, key: &JobKey) -> bool {
        match self.jobs.lock().remove(key) {
            Some(entry) => {
                debug!(job = %key, "Cancelling job");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether `key` currently has a pending or running job
    pub fn is_scheduled(&self, key: &JobKey) -> bool {
        self.jobs.lock().contains_key(key)
    }

    pub fn trigger_of(&self, key: &JobKey) -> Option<Trigger> {
        self.jobs.lock().get(key).map(|e| e.trigger)
    }

    pub fn keys(&self) -> Vec<JobKey> {
        let mut keys: Vec<JobKey> = self.jobs.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Stop accepting jobs, cancel every job and wait for running ones
    ///
    /// Jobs still running after a grace period are aborted.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let entries: Vec<(JobKey, JobEntry)> = self.jobs.lock().drain().collect();
        info!("Job scheduler stopping ({} jobs)", entries.len());

        let mut handles = Vec::with_capacity(entries.len());
        for (key, entry) in entries {
            entry.cancel.cancel();
            handles.push((key, entry.handle));
        }
        for (key, mut handle) in handles {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(job = %key, "Job did not finish in time, aborting");
                    handle.abort();
                }
            }
        }
        info!("Job scheduler stopped");
    }

    fn run_lock(&self, key: &JobKey) -> Arc<tokio::sync::Mutex<()>> {
        self.run_locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

async fn run_job(
    key: JobKey,
    generation: u64,
    trigger: Trigger,
    task: JobTask,
    cancel: Arc<CancelSignal>,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    jobs: Arc<JobTable>,
) {
    loop {
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            guard = run_lock.lock() => guard,
        };
        if cancel.is_cancelled() {
            break;
        }
        (*task)().await;
        drop(guard);

        match trigger {
            Trigger::Once => break,
            Trigger::Every(interval) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
    }

    // A replacement may already own the key
    let mut jobs = jobs.lock();
    if jobs.get(&key).map(|e| e.generation) == Some(generation) {
        jobs.remove(&key);
    }
}

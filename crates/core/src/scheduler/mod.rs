// Copyright © 2026 Kirky.X
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod jobs;

pub use jobs::*;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::types::{CoreError, Result};

/// 任务触发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Interval(Duration),
    /// 每天 UTC 的固定时刻
    DailyAt(NaiveTime),
}

impl Trigger {
    /// 从 `now` 起到下一次触发的等待时间
    pub fn delay_from(&self, now: DateTime<Utc>) -> Duration {
        match self {
            Trigger::Interval(period) => *period,
            Trigger::DailyAt(at) => {
                let today = now.date_naive().and_time(*at).and_utc();
                let next = if today > now {
                    today
                } else {
                    today + chrono::Duration::days(1)
                };
                (next - now).to_std().unwrap_or(Duration::ZERO)
            }
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Interval(period) => write!(f, "every {:?}", period),
            Trigger::DailyAt(at) => write!(f, "daily at {} UTC", at.format("%H:%M")),
        }
    }
}

pub type JobHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone)]
pub struct JobDescriptor {
    pub id: String,
    pub name: String,
    pub trigger: Trigger,
    pub handler: JobHandler,
    /// 错过的触发合并为一次，而不是连续补跑
    pub coalesce: bool,
    pub max_instances: usize,
}

impl fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .field("coalesce", &self.coalesce)
            .field("max_instances", &self.max_instances)
            .finish()
    }
}

impl JobDescriptor {
    pub fn new<F, Fut>(
        id: impl Into<String>,
        name: impl Into<String>,
        trigger: Trigger,
        handler: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            trigger,
            handler: Arc::new(move || handler().boxed()),
            coalesce: true,
            max_instances: 1,
        }
    }

    pub fn coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed(String),
    Skipped(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub name: String,
    pub trigger: String,
    pub state: JobState,
    pub runs: u64,
    pub failures: u64,
    pub skipped: u64,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<u64>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct JobRuntime {
    runs: u64,
    failures: u64,
    skipped: u64,
    last_error: Option<String>,
    last_duration: Option<Duration>,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
}

struct JobEntry {
    descriptor: JobDescriptor,
    runtime: Mutex<JobRuntime>,
    paused: AtomicBool,
    running: AtomicUsize,
}

/// 退出作用域时归还运行槽位，循环任务被中止时也能正确计数
struct RunningSlot<'a>(&'a AtomicUsize);

impl Drop for RunningSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl JobEntry {
    fn new(descriptor: JobDescriptor) -> Self {
        Self {
            descriptor,
            runtime: Mutex::new(JobRuntime::default()),
            paused: AtomicBool::new(false),
            running: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> JobState {
        if self.running.load(Ordering::SeqCst) > 0 {
            JobState::Running
        } else if self.paused.load(Ordering::SeqCst) {
            JobState::Paused
        } else {
            JobState::Idle
        }
    }

    fn skip(&self, reason: &str) -> JobOutcome {
        self.runtime.lock().skipped += 1;
        debug!("Job {} skipped: {}", self.descriptor.id, reason);
        JobOutcome::Skipped(reason.to_string())
    }

    fn set_next_run(&self, delay: Duration) {
        self.runtime.lock().next_run_at = chrono::Duration::from_std(delay)
            .ok()
            .map(|d| Utc::now() + d);
    }

    fn status(&self) -> JobStatus {
        let runtime = self.runtime.lock();
        JobStatus {
            id: self.descriptor.id.clone(),
            name: self.descriptor.name.clone(),
            trigger: self.descriptor.trigger.to_string(),
            state: self.state(),
            runs: runtime.runs,
            failures: runtime.failures,
            skipped: runtime.skipped,
            last_error: runtime.last_error.clone(),
            last_duration_ms: runtime.last_duration.map(|d| d.as_millis() as u64),
            last_run_at: runtime.last_run_at,
            next_run_at: runtime.next_run_at,
        }
    }

    /// 执行一次。任务在独立的 tokio 任务中运行，panic 被记为失败
    async fn execute(&self) -> JobOutcome {
        if self.paused.load(Ordering::SeqCst) {
            return self.skip("paused");
        }
        let previous = self.running.fetch_add(1, Ordering::SeqCst);
        let _slot = RunningSlot(&self.running);
        if previous >= self.descriptor.max_instances {
            return self.skip("max instances running");
        }

        let id = &self.descriptor.id;
        let started = Instant::now();
        let started_at = Utc::now();
        debug!("Job {} started", id);

        let outcome = match tokio::spawn((self.descriptor.handler)()).await {
            Ok(Ok(())) => JobOutcome::Completed,
            Ok(Err(e)) => JobOutcome::Failed(e.to_string()),
            Err(e) if e.is_panic() => JobOutcome::Failed("job panicked".to_string()),
            Err(_) => JobOutcome::Failed("job cancelled".to_string()),
        };
        let elapsed = started.elapsed();

        let mut runtime = self.runtime.lock();
        runtime.runs += 1;
        runtime.last_run_at = Some(started_at);
        runtime.last_duration = Some(elapsed);
        match &outcome {
            JobOutcome::Failed(reason) => {
                runtime.failures += 1;
                runtime.last_error = Some(reason.clone());
                error!("Job {} failed after {:?}: {}", id, elapsed, reason);
            }
            _ => {
                runtime.last_error = None;
                debug!("Job {} completed in {:?}", id, elapsed);
            }
        }
        outcome
    }
}

async fn run_loop(entry: Arc<JobEntry>, cancel: CancellationToken) {
    let trigger = entry.descriptor.trigger;
    info!("Job {} scheduled {}", entry.descriptor.id, trigger);

    match trigger {
        Trigger::Interval(period) => {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(if entry.descriptor.coalesce {
                MissedTickBehavior::Skip
            } else {
                MissedTickBehavior::Burst
            });
            loop {
                entry.set_next_run(ticker.period());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        entry.execute().await;
                    }
                }
            }
        }
        Trigger::DailyAt(_) => loop {
            let delay = trigger.delay_from(Utc::now());
            entry.set_next_run(delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = time::sleep(delay) => {
                    entry.execute().await;
                }
            }
        },
    }

    entry.runtime.lock().next_run_at = None;
    debug!("Job {} loop stopped", entry.descriptor.id);
}

/// 周期任务调度器
///
/// 每个任务一个循环任务，同一任务最多一个实例在跑；
/// `start` / `stop` 可重复调用，`stop` 等待进行中的任务到超时为止，之后放弃。
pub struct Scheduler {
    jobs: DashMap<String, Arc<JobEntry>>,
    cancel: Mutex<Option<CancellationToken>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl Scheduler {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            cancel: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
            shutdown_timeout,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(Duration::from_secs(config.shutdown_timeout_secs))
    }

    pub fn add_job(&self, descriptor: JobDescriptor) -> Result<()> {
        if let Trigger::Interval(period) = descriptor.trigger {
            if period.is_zero() {
                return Err(CoreError::Configuration(format!(
                    "job {} has a zero interval",
                    descriptor.id
                )));
            }
        }
        if descriptor.max_instances == 0 {
            return Err(CoreError::Configuration(format!(
                "job {} must allow at least one instance",
                descriptor.id
            )));
        }
        if self.jobs.contains_key(&descriptor.id) {
            return Err(CoreError::Configuration(format!(
                "job {} already registered",
                descriptor.id
            )));
        }

        let entry = Arc::new(JobEntry::new(descriptor));
        self.jobs
            .insert(entry.descriptor.id.clone(), Arc::clone(&entry));

        if let Some(token) = self.cancel.lock().as_ref() {
            let handle = tokio::spawn(run_loop(entry, token.child_token()));
            self.handles.lock().push(handle);
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.cancel.lock().is_some()
    }

    /// 已经在运行时返回 false
    pub fn start(&self) -> bool {
        let mut cancel = self.cancel.lock();
        if cancel.is_some() {
            debug!("Scheduler already running");
            return false;
        }

        let token = CancellationToken::new();
        let mut handles = self.handles.lock();
        for job in self.jobs.iter() {
            handles.push(tokio::spawn(run_loop(
                Arc::clone(job.value()),
                token.child_token(),
            )));
        }
        *cancel = Some(token);
        info!("Scheduler started with {} jobs", handles.len());
        true
    }

    pub async fn stop(&self) {
        let Some(token) = self.cancel.lock().take() else {
            return;
        };
        token.cancel();

        let mut handles = std::mem::take(&mut *self.handles.lock());
        let joined = time::timeout(self.shutdown_timeout, join_all(handles.iter_mut())).await;
        if joined.is_err() {
            warn!(
                "Scheduler jobs did not finish within {:?}, abandoning them",
                self.shutdown_timeout
            );
            for handle in &handles {
                handle.abort();
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
        info!("Scheduler stopped");
    }

    fn entry(&self, id: &str) -> Result<Arc<JobEntry>> {
        self.jobs
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| CoreError::JobNotFound(id.to_string()))
    }

    /// 立即执行一次，不影响原有的触发计划
    pub async fn run_now(&self, id: &str) -> Result<JobOutcome> {
        let entry = self.entry(id)?;
        Ok(entry.execute().await)
    }

    /// 暂停后定时触发与手动触发都会被跳过，进行中的一次不受影响
    pub fn pause(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        if !entry.paused.swap(true, Ordering::SeqCst) {
            info!("Job {} paused", id);
        }
        Ok(())
    }

    pub fn resume(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        if entry.paused.swap(false, Ordering::SeqCst) {
            info!("Job {} resumed", id);
        }
        Ok(())
    }

    pub fn job(&self, id: &str) -> Result<JobStatus> {
        Ok(self.entry(id)?.status())
    }

    pub fn job_status(&self) -> Vec<JobStatus> {
        let mut statuses: Vec<JobStatus> = self.jobs.iter().map(|e| e.value().status()).collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }
}

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

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cache::{CacheManager, CachePriority, Warmer};
use crate::config::SchedulerConfig;
use crate::scheduler::{JobDescriptor, Scheduler, Trigger};
use crate::types::{CoreError, Result};

pub const WARM_CRITICAL_JOB: &str = "warm_critical";
pub const WARM_HIGH_JOB: &str = "warm_high";
pub const TTL_SWEEP_JOB: &str = "ttl_sweep";
pub const DEEP_CLEANUP_JOB: &str = "deep_cleanup";
pub const HEALTH_CHECK_JOB: &str = "health_check";

fn warm_job(
    id: &str,
    name: &str,
    period: Duration,
    warmer: &Arc<Warmer>,
    priority: CachePriority,
) -> JobDescriptor {
    let warmer = Arc::clone(warmer);
    JobDescriptor::new(id, name, Trigger::Interval(period), move || {
        let warmer = Arc::clone(&warmer);
        async move {
            let report = warmer.warm_all(priority).await;
            if report.total_errors > 0 {
                return Err(CoreError::Internal(format!(
                    "{} warm errors across {} categories",
                    report.total_errors,
                    report.reports.len()
                )));
            }
            Ok(())
        }
    })
}

/// 注册标准任务集：关键分类预热、高优先级预热、TTL 清理、每日深度清理、健康检查
pub fn register_default_jobs(
    scheduler: &Scheduler,
    manager: Arc<CacheManager>,
    warmer: Arc<Warmer>,
    config: &SchedulerConfig,
) -> Result<()> {
    let deep_cleanup_at = config
        .deep_cleanup_time()
        .map_err(|e| CoreError::Configuration(e.to_string()))?;

    scheduler.add_job(warm_job(
        WARM_CRITICAL_JOB,
        "Warm critical categories",
        Duration::from_secs(config.warm_critical_secs),
        &warmer,
        CachePriority::Critical,
    ))?;
    scheduler.add_job(warm_job(
        WARM_HIGH_JOB,
        "Warm high priority categories",
        Duration::from_secs(config.warm_high_secs),
        &warmer,
        CachePriority::High,
    ))?;

    let sweep_manager = Arc::clone(&manager);
    scheduler.add_job(JobDescriptor::new(
        TTL_SWEEP_JOB,
        "Purge expired L1 entries",
        Trigger::Interval(Duration::from_secs(config.ttl_sweep_secs)),
        move || {
            let manager = Arc::clone(&sweep_manager);
            async move {
                let purged = manager.purge_expired();
                info!("TTL sweep purged {} expired entries", purged);
                Ok(())
            }
        },
    ))?;

    let cleanup_manager = Arc::clone(&manager);
    let max_idle = Duration::from_secs(config.deep_cleanup_idle_secs);
    scheduler.add_job(JobDescriptor::new(
        DEEP_CLEANUP_JOB,
        "Daily deep cleanup",
        Trigger::DailyAt(deep_cleanup_at),
        move || {
            let manager = Arc::clone(&cleanup_manager);
            async move {
                manager.deep_cleanup(max_idle);
                Ok(())
            }
        },
    ))?;

    scheduler.add_job(JobDescriptor::new(
        HEALTH_CHECK_JOB,
        "Distributed tier health check",
        Trigger::Interval(Duration::from_secs(config.health_check_secs)),
        move || {
            let manager = Arc::clone(&manager);
            async move {
                if manager.health_check().await {
                    Ok(())
                } else {
                    Err(CoreError::Connection("L2 health check failed".to_string()))
                }
            }
        },
    ))?;

    info!("Registered default cache maintenance jobs");
    Ok(())
}

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

use crate::error_handler::handle_core_error;
use crate::models::{ClearRequest, EventRequest, HealthResponse, WarmRequest};
use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use stockpile_core::cache::{
    store_from_config, CacheCategory, CacheLevel, CacheManager, CachePriority, CacheStatus,
    CategoryPolicyRegistry, ClearReport, InvalidationReport, InvalidationRouter, L1Cache, L2Cache,
    ManagerDefaults, ReconnectPolicy, Warmer,
};
use stockpile_core::config::Config;
use stockpile_core::scheduler::{register_default_jobs, JobOutcome, JobStatus, Scheduler};
use stockpile_core::types::Result;
use tracing::info;

/// 组装好的缓存子系统，HTTP 处理函数共享
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<CacheManager>,
    pub warmer: Arc<Warmer>,
    pub invalidation: Arc<InvalidationRouter>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    /// 按配置构造各组件并注册默认任务；不启动调度器和 L1 清理任务
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = store_from_config(&config.l2)?;
        let l2 = L2Cache::new(store, ReconnectPolicy::from_config(&config.l2));
        let l1 = Arc::new(L1Cache::from_config(&config.l1));
        let registry = Arc::new(CategoryPolicyRegistry::from_overrides(&config.categories)?);

        let manager = Arc::new(CacheManager::new(
            l1,
            l2,
            registry,
            ManagerDefaults::from_config(&config.manager),
        ));
        let invalidation = Arc::new(InvalidationRouter::new(manager.clone()));
        let warmer = Arc::new(Warmer::new(manager.clone()));

        let scheduler = Arc::new(Scheduler::from_config(&config.scheduler));
        register_default_jobs(
            &scheduler,
            manager.clone(),
            warmer.clone(),
            &config.scheduler,
        )?;

        info!(
            "Cache subsystem assembled: {} invalidation events, {} scheduled jobs",
            invalidation.events().len(),
            scheduler.job_status().len()
        );

        Ok(Self {
            manager,
            warmer,
            invalidation,
            scheduler,
        })
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/cache/status", get(handle_cache_status))
        .route("/cache/clear", post(handle_clear))
        .route("/cache/warm", post(handle_warm))
        .route("/cache/events", post(handle_event))
        .route("/scheduler/jobs", get(handle_list_jobs))
        .route("/scheduler/jobs/{id}/run", post(handle_run_job))
        .with_state(state)
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let l2_available = state.manager.l2().is_available();
    let status = if l2_available { "healthy" } else { "degraded" };
    Json(HealthResponse {
        status: status.to_string(),
        l2_available,
    })
}

async fn handle_cache_status(State(state): State<AppState>) -> Json<CacheStatus> {
    Json(state.manager.status().await)
}

async fn handle_clear(
    State(state): State<AppState>,
    Json(req): Json<ClearRequest>,
) -> std::result::Result<Json<ClearReport>, Response> {
    let level = match req.level.as_deref() {
        Some(level) => level.parse::<CacheLevel>().map_err(handle_core_error)?,
        None => CacheLevel::Both,
    };

    let report = state
        .manager
        .clear(level, &req.pattern)
        .await
        .map_err(handle_core_error)?;
    info!(
        "Cleared {} entries matching '{}' ({:?})",
        report.total_cleared, req.pattern, level
    );
    Ok(Json(report))
}

async fn handle_warm(
    State(state): State<AppState>,
    Json(req): Json<WarmRequest>,
) -> std::result::Result<Response, Response> {
    if let Some(category) = req.category {
        let category = category
            .parse::<CacheCategory>()
            .map_err(handle_core_error)?;
        return Ok(Json(state.warmer.warm(category).await).into_response());
    }

    let priority = match req.priority.as_deref() {
        Some(priority) => priority
            .parse::<CachePriority>()
            .map_err(handle_core_error)?,
        None => CachePriority::Critical,
    };
    Ok(Json(state.warmer.warm_all(priority).await).into_response())
}

async fn handle_event(
    State(state): State<AppState>,
    Json(req): Json<EventRequest>,
) -> Json<InvalidationReport> {
    Json(state.invalidation.on_event(&req.event, &req.context).await)
}

async fn handle_list_jobs(State(state): State<AppState>) -> Json<Vec<JobStatus>> {
    Json(state.scheduler.job_status())
}

async fn handle_run_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<JobOutcome>, Response> {
    state
        .scheduler
        .run_now(&id)
        .await
        .map(Json)
        .map_err(handle_core_error)
}

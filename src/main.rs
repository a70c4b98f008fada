// Copyright 2025 Kirky.X
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

use aiqueue::config::settings::Settings;
use aiqueue::infrastructure::database::connection;
use aiqueue::infrastructure::providers::http_gateway::{HttpProviderGateway, ProviderEndpoint};
use aiqueue::infrastructure::repositories::task_repo_impl::TaskRepositoryImpl;
use aiqueue::queue::dispatcher::{DispatcherConfig, QueueDispatcher};
use aiqueue::queue::rate_limiter::{ProviderLimits, RateLimiter};
use aiqueue::queue::recovery::{RecoveryService, StaticLimitsSource};
use aiqueue::utils::retry_policy::RetryPolicy;
use aiqueue::utils::telemetry;
use migration::{Migrator, MigratorTrait};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

/// 主函数
///
/// 应用程序入口点：先完成恢复清扫，再启动调度器。
/// 在恢复完成之前不接收任何新工作。
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize logging
    telemetry::init_telemetry();
    info!("Starting aiqueue...");

    // Initialize Prometheus Metrics
    aiqueue::infrastructure::metrics::init_metrics();

    // 2. Load configuration
    let settings = Arc::new(Settings::new()?);
    info!("Configuration loaded");

    // 3. Connect to database
    let db = connection::create_pool(&settings.database).await?;
    let db = Arc::new(db);
    info!("Database connection established");

    // Run database migrations
    info!("Running database migrations...");
    Migrator::up(db.as_ref(), None).await?;
    info!("Database migrations applied");

    // 4. Initialize Rate Limiter
    let default_budget = ProviderLimits {
        requests_per_minute: settings.rate_limiting.default_requests_per_minute,
        tokens_per_minute: settings.rate_limiting.default_tokens_per_minute,
    };
    let default_limits: HashMap<String, ProviderLimits> = settings
        .providers
        .keys()
        .map(|provider| (provider.clone(), default_budget))
        .collect();
    let rate_limiter = Arc::new(RateLimiter::new(default_limits, default_budget));
    info!("Rate limiter initialized");

    // 5. Initialize Provider Gateway
    // 租户凭证由外围应用在运行时通过 set_credential 写入
    let endpoints: HashMap<String, ProviderEndpoint> = settings
        .providers
        .iter()
        .map(|(provider, cfg)| {
            (
                provider.clone(),
                ProviderEndpoint {
                    base_url: cfg.base_url.clone(),
                    model: cfg.model.clone(),
                },
            )
        })
        .collect();
    let gateway = Arc::new(HttpProviderGateway::new(endpoints));

    // 6. Initialize Components
    let task_repo = Arc::new(TaskRepositoryImpl::new(db.clone()));
    let limits_source = Arc::new(StaticLimitsSource::new());

    // 7. Run recovery before accepting any new work
    let recovery = RecoveryService::new(
        task_repo.clone(),
        gateway.clone(),
        rate_limiter.clone(),
        limits_source,
        chrono::Duration::minutes(settings.recovery.stuck_threshold_minutes),
    );
    let report = recovery.run().await?;
    info!(
        "Recovery complete: {} recovered, {} stuck-failed, {} recovery-failed",
        report.recovered, report.stuck_failed, report.recovery_failed
    );

    // 8. Start Dispatcher
    let retry_policy =
        RetryPolicy::from_millis(settings.queue.max_retries, &settings.queue.backoff_ms);
    let dispatcher_config = DispatcherConfig {
        poll_interval: Duration::from_millis(settings.queue.poll_interval_ms),
        invoke_timeout: Duration::from_secs(settings.queue.invoke_timeout_secs),
        batch_size: settings.queue.batch_size,
        retention: chrono::Duration::days(settings.queue.retention_days),
    };
    let dispatcher = QueueDispatcher::new(
        task_repo,
        rate_limiter,
        gateway,
        retry_policy,
        dispatcher_config,
    );
    dispatcher.start().await;

    // 9. Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => tracing::error!("Unable to listen for shutdown signal: {}", err),
    }

    dispatcher.shutdown().await;
    info!("aiqueue stopped");

    Ok(())
}

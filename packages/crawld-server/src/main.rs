//! Process entrypoint: loads configuration, wires the scheduling kernel
//! and frontier crates together, and runs every service until shutdown.

mod config;
mod service;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use crawld_core::execution::PostgresExecutionStore;
use crawld_core::leader::{LeaderElector, PostgresLeaseStore};
use crawld_core::logs::{InMemoryBlobStore, LogHub};
use crawld_core::queue::{PriorityQueue, RedisPriorityQueue};
use crawld_core::scheduler::{PostgresJobRepository, Scheduler};
use crawld_core::worker_pool::{JobHandler, WorkerPool, WorkerPoolConfig};
use crawld_core::Config;
use crawld_frontier::{
    fetch_worker::{FetchWorkerConfig, NullExtractor, NullIndexer},
    store::{FrontierClaimer, LinkSubmitter, PostgresFrontierStore},
    types::{FrontierOrigin, FrontierUrl},
    FetchWorker, HostPacingStore,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use service::Service;

/// Turns a dispatched job into frontier seed URLs. The crawl logic that
/// walks discovered links is out of scope here; this only performs the
/// hand-off the spec's flow diagram describes (job -> seed frontier entry).
struct SeedJobHandler<L: LinkSubmitter> {
    frontier: Arc<L>,
}

#[async_trait]
impl<L: LinkSubmitter + Send + Sync> JobHandler for SeedJobHandler<L> {
    async fn handle(&self, job: &crawld_core::types::Job) -> anyhow::Result<()> {
        let seed = FrontierUrl::builder()
            .source_id(job.source_id.clone())
            .url(job.url.clone())
            .host(host_of(&job.url))
            .origin(FrontierOrigin::Seed)
            .build();
        self.frontier.submit(seed).await?;
        info!(job_id = %job.id, "seeded frontier from dispatched job");
        Ok(())
    }
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

struct LeaderService {
    elector: LeaderElector<PostgresLeaseStore>,
    renew_interval: Duration,
    is_leader: Arc<AtomicBool>,
}

#[async_trait]
impl Service for LeaderService {
    fn name(&self) -> &'static str {
        "leader-election"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.renew_interval) => {
                    let won = self.elector.tick().await.unwrap_or(false);
                    self.is_leader.store(won, Ordering::SeqCst);
                }
            }
        }
        self.is_leader.store(false, Ordering::SeqCst);
        self.elector.step_down().await.ok();
        Ok(())
    }
}

struct SchedulerService<Q: PriorityQueue + 'static> {
    scheduler: Scheduler<Q>,
    poll_interval: Duration,
    is_leader: Arc<AtomicBool>,
}

#[async_trait]
impl<Q: PriorityQueue + 'static> Service for SchedulerService<Q> {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {
                    if !self.is_leader.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Err(e) = self.scheduler.tick(chrono::Utc::now()).await {
                        tracing::warn!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
        Ok(())
    }
}

struct WorkerPoolService<Q: PriorityQueue + 'static> {
    pool: WorkerPool<Q>,
}

#[async_trait]
impl<Q: PriorityQueue + 'static> Service for WorkerPoolService<Q> {
    fn name(&self) -> &'static str {
        "worker-pool"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.pool.run(shutdown).await
    }
}

struct FetchWorkerService<F: FrontierClaimer + 'static> {
    worker: FetchWorker<F>,
    claim_retry_delay: Duration,
}

#[async_trait]
impl<F: FrontierClaimer + 'static> Service for FetchWorkerService<F> {
    fn name(&self) -> &'static str {
        "fetch-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.worker.tick(&shutdown).await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.claim_retry_delay).await,
                Err(e) => {
                    tracing::warn!(error = %e, "fetch worker tick failed");
                    tokio::time::sleep(self.claim_retry_delay).await;
                }
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,crawld=debug".into()))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_line_number(true))
        .init();

    info!("starting crawld");

    let config = Config::from_env().context("failed to load configuration")?;

    let pg_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to postgres")?;

    let redis_cfg = deadpool_redis::Config::from_url(config.redis_url.clone());
    let redis_pool = redis_cfg
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .context("failed to create redis pool")?;

    let queue = Arc::new(RedisPriorityQueue::new(
        redis_pool,
        config.stream_prefix.clone(),
        config.consumer_group.clone(),
        config.max_stream_len,
    ));

    let job_repository = Arc::new(PostgresJobRepository::new(pg_pool.clone()));
    let execution_store = Arc::new(PostgresExecutionStore::new(pg_pool.clone()));
    let log_hub = Arc::new(LogHub::new(config.log_buffer_cap));
    // No object-storage crate is wired yet; archived logs live only as
    // long as this process does until a real BlobStore backend lands.
    let blob_store = Arc::new(InMemoryBlobStore::new());
    let frontier_store = Arc::new(PostgresFrontierStore::new(pg_pool.clone()));
    let pacing = Arc::new(HostPacingStore::new(config.robots_cache_ttl));

    let lease_store = PostgresLeaseStore::new(pg_pool.clone());
    let worker_id = format!("crawld-{}", Uuid::new_v4());
    let elector = LeaderElector::new(lease_store, config.leader_lease_key.clone(), worker_id.clone(), config.leader_lease_ttl);

    let scheduler = Scheduler::new(job_repository, queue.clone(), config.scheduler_batch_size);

    let job_handler = Arc::new(SeedJobHandler {
        frontier: frontier_store.clone(),
    });
    let worker_pool = WorkerPool::new(
        queue.clone(),
        job_handler,
        execution_store,
        log_hub,
        blob_store,
        WorkerPoolConfig {
            concurrency: config.worker_pool_size,
            batch_size: config.scheduler_batch_size as usize,
            task_timeout: config.task_timeout,
            drain_timeout: config.drain_timeout,
            poll_interval: Duration::from_millis(200),
            claim_min_idle: config.claim_min_idle,
        },
        worker_id,
    );

    let fetch_worker = FetchWorker::new(
        frontier_store,
        pacing,
        Arc::new(NullExtractor),
        Arc::new(NullIndexer),
        FetchWorkerConfig {
            user_agent: config.fetch_user_agent.clone(),
            max_redirects: config.max_redirects,
            response_body_cap_bytes: config.response_body_cap_bytes,
            robots_body_cap_bytes: config.robots_body_cap_bytes,
            claim_retry_delay: config.claim_retry_delay,
            max_retries: 3,
        },
    );

    let is_leader = Arc::new(AtomicBool::new(false));

    let shutdown = CancellationToken::new();
    let services: Vec<Box<dyn Service>> = vec![
        Box::new(LeaderService {
            elector,
            renew_interval: config.leader_lease_ttl / 2,
            is_leader: is_leader.clone(),
        }),
        Box::new(SchedulerService {
            scheduler,
            poll_interval: config.scheduler_poll_interval,
            is_leader: is_leader.clone(),
        }),
        Box::new(WorkerPoolService { pool: worker_pool }),
        Box::new(FetchWorkerService {
            worker: fetch_worker,
            claim_retry_delay: config.claim_retry_delay,
        }),
    ];

    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("ctrl-c received");
        shutdown_signal.cancel();
    });

    service::run_until_shutdown(services, shutdown, config.drain_timeout).await;
    info!("crawld stopped");
    Ok(())
}

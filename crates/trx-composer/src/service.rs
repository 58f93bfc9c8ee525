//! Wiring of stores, queue and background loops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;
use trx_queue::{DispatchConfig, DispatchQueue, MemoryQueueStore, QueueStore, RedisQueueStore, TaskMeta};
use trx_store::{ClaimStore, MemoryClaimStore, PgClaimStore, PgStoreConfig};

use crate::admission::{AdmissionLimits, Admitter, EncoderRouting};
use crate::assembler::Assembler;
use crate::config::ComposerConfig;
use crate::error::ComposerResult;
use crate::lifecycle::Lifecycle;
use crate::phase::PhasePool;
use crate::splitter::Splitter;
use crate::state::AppState;

/// The coordinator: HTTP state plus the admitter and phase pools.
pub struct ComposerService {
    config: Arc<ComposerConfig>,
    lifecycle: Lifecycle,
    dispatch: DispatchQueue,
    admitter: Admitter,
    http: reqwest::Client,
}

impl ComposerService {
    /// Connect to the configured stores. Without a Postgres DSN or Redis URL
    /// the in-memory stores are used, which only suits a single node.
    pub async fn connect(config: ComposerConfig) -> ComposerResult<Self> {
        let claims: Arc<dyn ClaimStore> = match &config.postgres_dsn {
            Some(dsn) => Arc::new(PgClaimStore::connect(&PgStoreConfig::new(dsn.clone())).await?),
            None => {
                info!("POSTGRES_DSN not set, using in-memory claim store");
                Arc::new(MemoryClaimStore::new())
            }
        };
        let queue: Arc<dyn QueueStore> = match &config.redis_url {
            Some(url) => Arc::new(RedisQueueStore::connect(url).await?),
            None => {
                info!("REDIS_URL not set, using in-memory queue store");
                Arc::new(MemoryQueueStore::new())
            }
        };

        Ok(Self::with_stores(config, claims, queue))
    }

    pub fn with_stores(config: ComposerConfig, claims: Arc<dyn ClaimStore>, queue: Arc<dyn QueueStore>) -> Self {
        let config = Arc::new(config);
        let admitter = Admitter::new(
            Arc::clone(&claims),
            Arc::new(EncoderRouting),
            AdmissionLimits {
                max_tasks: config.routing_max_tasks,
                max_duration: config.routing_max_duration,
                max_file_size: config.routing_max_file_size,
            },
            config.admission_interval,
        );
        let dispatch = DispatchQueue::new(Arc::clone(&queue), DispatchConfig::default())
            .with_hook(Arc::new(admitter.waker()));
        let lifecycle = Lifecycle::new(claims, TaskMeta::new(queue));
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            config,
            lifecycle,
            dispatch,
            admitter,
            http,
        }
    }

    pub fn state(&self) -> AppState {
        AppState::new(Arc::clone(&self.config), self.lifecycle.clone(), self.dispatch.clone())
    }

    /// Start the admitter and both phase pools. They stop once `shutdown`
    /// flips; phase workers finish the task they hold first.
    pub fn spawn_background(self, shutdown: watch::Receiver<bool>) -> JoinSet<()> {
        let mut set = JoinSet::new();
        let store = Arc::clone(self.lifecycle.store());

        let splitter = Splitter::new(
            Arc::clone(&self.config),
            self.lifecycle.clone(),
            self.dispatch.clone(),
            self.http.clone(),
        );
        let assembler = Assembler::new(Arc::clone(&self.config), self.lifecycle.clone());

        set.spawn(
            PhasePool::new(Arc::new(splitter), Arc::clone(&store), self.config.splitter).run(shutdown.clone()),
        );
        set.spawn(PhasePool::new(Arc::new(assembler), store, self.config.assembler).run(shutdown.clone()));
        set.spawn(self.admitter.run(shutdown));

        set
    }
}

use std::sync::Arc;

use tracing::debug;

use crate::autotranscode::AutoTranscoder;
use crate::cache::{MemoryStore, SharedStore, SqliteKvStore};
use crate::config::{CacheBackend, DispatchMode, VodkitConfig};
use crate::dispatch::{
    Broker, JobDispatcher, JobQueue, RetryController, RetryPolicy, SqliteBroker,
    TranscodeStateHandles, TranscodeWorker,
};
use crate::encoder::{CommandExecutor, EncoderExecutor, SystemCommandExecutor};
use crate::error::TranscodeResult;
use crate::indexer::RenditionIndexer;
use crate::public_id::PublicIdResolver;
use crate::state::{PendingMarker, StatusTracker, TranscodeLock};
use crate::storage::{MediaLayout, RenditionStore, SqliteRenditionStore};

/// Every component wired from one config, sharing one key-value store and one
/// rendition database.
#[derive(Debug, Clone)]
pub struct TranscodeContext {
    pub config: VodkitConfig,
    pub store: SharedStore,
    pub database: Arc<SqliteRenditionStore>,
    pub renditions: RenditionStore,
    pub indexer: Arc<RenditionIndexer>,
    pub dispatcher: Arc<JobDispatcher>,
    pub broker: Option<Arc<SqliteBroker>>,
    pub resolver: PublicIdResolver,
    pub autotranscoder: AutoTranscoder,
}

impl TranscodeContext {
    pub fn open(config: VodkitConfig) -> TranscodeResult<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: VodkitConfig) -> TranscodeContextBuilder {
        TranscodeContextBuilder {
            config,
            executor: Arc::new(SystemCommandExecutor),
            retry: None,
            store: None,
        }
    }

    /// Worker draining the configured queue; `None` without a broker.
    pub fn worker(&self) -> Option<TranscodeWorker> {
        self.broker.as_ref().map(|broker| {
            let jobs: Arc<dyn JobQueue> = broker.clone();
            TranscodeWorker::new(
                jobs,
                Arc::clone(&self.dispatcher),
                self.config.dispatch.queue_name.clone(),
            )
            .with_fast_mode(self.config.retry.fast_mode)
        })
    }
}

#[derive(Debug)]
pub struct TranscodeContextBuilder {
    config: VodkitConfig,
    executor: Arc<dyn CommandExecutor>,
    retry: Option<RetryController>,
    store: Option<SharedStore>,
}

impl TranscodeContextBuilder {
    pub fn executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn retry(mut self, retry: RetryController) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> TranscodeResult<TranscodeContext> {
        let config = self.config;
        let store: SharedStore = match (self.store, config.cache.backend) {
            (Some(store), _) => store,
            (None, CacheBackend::Memory) => Arc::new(MemoryStore::new()),
            (None, CacheBackend::Sqlite) => Arc::new(SqliteKvStore::new(config.cache_db())?),
        };

        let database = Arc::new(SqliteRenditionStore::new(config.renditions_db())?);
        database.initialize()?;

        let layout = MediaLayout::new(config.media_root());
        let indexer = Arc::new(RenditionIndexer::new(
            layout.clone(),
            Arc::clone(&database),
            Arc::clone(&store),
            config.indexer.guard_window(),
        ));
        let renditions =
            RenditionStore::new(layout.clone(), Arc::clone(&database)).with_self_heal(Arc::clone(&indexer));

        let state = TranscodeStateHandles {
            lock: TranscodeLock::new(Arc::clone(&store), config.transcode.lock_ttl()),
            pending: PendingMarker::new(Arc::clone(&store), config.transcode.pending_ttl()),
            status: StatusTracker::new(
                Arc::clone(&store),
                layout,
                config.transcode.status_ttl(),
                config.transcode.failed_status_ttl(),
            ),
        };
        let encoder = EncoderExecutor::new(config.encoder.clone(), renditions.clone())
            .with_executor(self.executor);
        let retry = self
            .retry
            .unwrap_or_else(|| RetryController::new(RetryPolicy::new(&config.retry)));

        let broker = match config.dispatch.mode {
            DispatchMode::Broker => {
                let broker = Arc::new(SqliteBroker::new(config.broker_db())?);
                broker.initialize()?;
                Some(broker)
            }
            DispatchMode::Inline => None,
        };

        let mut dispatcher = JobDispatcher::new(
            config.dispatch.mode,
            state,
            encoder,
            retry,
            config.dispatch.clone(),
        );
        if let Some(broker) = &broker {
            let shared: Arc<dyn Broker> = broker.clone();
            dispatcher = dispatcher.with_broker(shared);
        }
        let dispatcher = Arc::new(dispatcher);
        debug!(mode = config.dispatch.mode.as_str(), "transcode context ready");

        Ok(TranscodeContext {
            resolver: PublicIdResolver::new(Arc::clone(&database)),
            autotranscoder: AutoTranscoder::new(
                config.autotranscode.clone(),
                Arc::clone(&store),
                Arc::clone(&dispatcher),
            ),
            config,
            store,
            database,
            renditions,
            indexer,
            dispatcher,
            broker,
        })
    }
}

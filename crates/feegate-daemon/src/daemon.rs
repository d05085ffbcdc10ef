//! Wires the drivers, adapters and health endpoint from a [`FeegateConfig`].
//!
//! [`Daemon::start`] spawns every enabled task and returns immediately. An
//! embedding API layer reaches the fee lifecycle through
//! [`Daemon::query`]; the binary only waits for a signal and calls
//! [`Daemon::join`].

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use feegate_core::collaborators::{
    ExecutionQueue, PolicyDirectory, SettlementClient, TransactionOracle,
};
use feegate_core::config::FeegateConfig;
use feegate_core::{FeeStore, StoreError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::db::Database;
use crate::deactivator::Deactivator;
use crate::driver::{log_pass_error, run_periodic};
use crate::executor::{Executor, ExecutorSettings};
use crate::health;
use crate::oracle::SqliteTxIndexOracle;
use crate::policy::SqlitePolicyDirectory;
use crate::query::QueryService;
use crate::queue::{ExecutionConsumer, channel};
use crate::reconciler::{Reconciler, ReconcilerSettings};
use crate::settlement::HttpSettlementClient;
use crate::state::{DaemonState, ShutdownSignal};
use crate::store::SqliteFeeStore;

/// Errors that prevent the daemon from starting.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StartError {
    /// The fee store could not be opened.
    #[error("failed to open fee store: {0}")]
    Store(#[from] StoreError),

    /// `health.bind` is not an IP address.
    #[error("invalid health bind address: {0}")]
    InvalidBind(String),

    /// The health listener could not be bound.
    #[error("failed to bind health endpoint on {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// A running daemon.
pub struct Daemon {
    query: Arc<QueryService>,
    health_addr: Option<SocketAddr>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Daemon {
    /// Starts the daemon with the HTTP signer sidecar from `config.signer`.
    ///
    /// # Errors
    ///
    /// See [`StartError`].
    pub async fn start(
        config: &FeegateConfig,
        shutdown: ShutdownSignal,
    ) -> Result<Self, StartError> {
        let settlement = Arc::new(HttpSettlementClient::new(
            config.signer.base_url.clone(),
            Duration::from_secs(config.signer.request_timeout_secs),
        ));
        Self::start_with_settlement(config, settlement, shutdown).await
    }

    /// Starts the daemon with a caller-supplied settlement client.
    ///
    /// # Errors
    ///
    /// See [`StartError`].
    pub async fn start_with_settlement(
        config: &FeegateConfig,
        settlement: Arc<dyn SettlementClient>,
        shutdown: ShutdownSignal,
    ) -> Result<Self, StartError> {
        let db = Database::open(
            &config.store.path,
            Duration::from_millis(config.store.busy_timeout_ms),
        )?;

        let store: Arc<dyn FeeStore> = Arc::new(SqliteFeeStore::new(db.clone()));
        let policies: Arc<dyn PolicyDirectory> = Arc::new(SqlitePolicyDirectory::new(db.clone()));
        let oracle: Arc<dyn TransactionOracle> = Arc::new(SqliteTxIndexOracle::new(
            db,
            Duration::from_secs(config.oracle.mark_lost_after_secs),
        ));

        let call_timeout = config.executor.call_timeout();
        let terms = config.fee.terms();
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let (queue, rx) = channel(config.executor.queue_capacity);
        let queue: Arc<dyn ExecutionQueue> = Arc::new(queue);
        let query = Arc::new(QueryService::new(
            Arc::clone(&store),
            Arc::clone(&policies),
            queue,
            terms.clone(),
            call_timeout,
        ));

        if config.executor.enabled {
            let executor = Arc::new(Executor::new(
                Arc::clone(&store),
                settlement,
                Arc::clone(&oracle),
                ExecutorSettings {
                    call_timeout,
                    lease: config.executor.lease(),
                    execution_timeout: config.executor.execution_timeout(),
                },
            ));

            let consumer = ExecutionConsumer::new(rx, Arc::clone(&executor));
            tasks.push(("consumer", tokio::spawn(consumer.run(shutdown.clone()))));

            tasks.push((
                "executor",
                tokio::spawn(run_periodic(
                    "executor",
                    config.executor.poll_interval(),
                    shutdown.clone(),
                    move || {
                        let executor = Arc::clone(&executor);
                        async move {
                            if let Err(err) = executor.run_pending_pass().await {
                                log_pass_error("executor", &err);
                            }
                        }
                    },
                )),
            ));
        } else {
            // Execution requests are refused as `queue closed`.
            drop(rx);
            info!("executor disabled");
        }

        let deactivator = config.deactivator.enabled.then(|| {
            Deactivator::new(
                Arc::clone(&store),
                Arc::clone(&policies),
                config.deactivator.reason.clone(),
                call_timeout,
            )
        });

        if config.reconciler.enabled {
            let mut reconciler = Reconciler::new(
                Arc::clone(&store),
                Arc::clone(&policies),
                Arc::clone(&oracle),
                terms,
                ReconcilerSettings {
                    call_timeout,
                    discovery: config.reconciler.discovery,
                    repair_pending: config.reconciler.repair_pending,
                    mark_lost_after: Duration::from_secs(config.oracle.mark_lost_after_secs),
                },
            );
            if let Some(deactivator) = deactivator {
                reconciler = reconciler.with_deactivator(deactivator);
            }
            let reconciler = Arc::new(reconciler);
            tasks.push((
                "reconciler",
                tokio::spawn(run_periodic(
                    "reconciler",
                    config.reconciler.interval(),
                    shutdown.clone(),
                    move || {
                        let reconciler = Arc::clone(&reconciler);
                        async move {
                            reconciler.run_cycle().await;
                        }
                    },
                )),
            ));
        } else if let Some(deactivator) = deactivator {
            info!("reconciler disabled, running deactivator on its own");
            let deactivator = Arc::new(deactivator);
            tasks.push((
                "deactivator",
                tokio::spawn(run_periodic(
                    "deactivator",
                    config.reconciler.interval(),
                    shutdown.clone(),
                    move || {
                        let deactivator = Arc::clone(&deactivator);
                        async move {
                            match deactivator.run_pass().await {
                                Ok(report) => report.log("deactivation"),
                                Err(err) => log_pass_error("deactivation", &err),
                            }
                        }
                    },
                )),
            ));
        } else {
            info!("reconciler and deactivator disabled");
        }

        let mut health_addr = None;
        if config.health.enabled {
            let ip: IpAddr = config
                .health
                .bind
                .parse()
                .map_err(|_| StartError::InvalidBind(config.health.bind.clone()))?;
            let addr = SocketAddr::new(ip, config.health.port);
            let listener = health::bind(addr)
                .await
                .map_err(|source| StartError::Bind { addr, source })?;
            let bound = listener
                .local_addr()
                .map_err(|source| StartError::Bind { addr, source })?;
            health_addr = Some(bound);

            let app = health::router(DaemonState::new(shutdown.clone()));
            let health_shutdown = shutdown.clone();
            tasks.push((
                "health",
                tokio::spawn(async move {
                    if let Err(e) = health::serve(listener, app, health_shutdown).await {
                        error!("health endpoint failed: {e}");
                    }
                }),
            ));
        }

        info!(tasks = tasks.len(), "feegate daemon started");
        Ok(Self {
            query,
            health_addr,
            tasks,
        })
    }

    /// Query surface for an embedding API layer.
    #[must_use]
    pub fn query(&self) -> Arc<QueryService> {
        Arc::clone(&self.query)
    }

    /// Address the health endpoint is bound to, if enabled.
    #[must_use]
    pub const fn health_addr(&self) -> Option<SocketAddr> {
        self.health_addr
    }

    /// Waits for every task to stop. Call after requesting shutdown.
    pub async fn join(self) {
        let Self { query, tasks, .. } = self;
        drop(query);
        for (name, task) in tasks {
            if let Err(e) = task.await {
                warn!(task = name, "task ended abnormally: {e}");
            }
        }
    }
}

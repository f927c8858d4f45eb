//! Process-scoped engine: builds the pipeline from configuration, runs the
//! background loops, and drains cleanly on shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::collaborators::{Collaborators, ModelFoundryClient};
use crate::config::ArbitrageConfig;
use crate::error::{ArbitrageError, ConfigError};
use crate::llm::accountant::Accountant;
use crate::llm::failover::Dispatcher;
use crate::llm::health::HealthTracker;
use crate::llm::registry::ModelRegistry;
use crate::llm::routing::{Gatekeeper, PolicyStore, Router};
use crate::llm::smart_client::{ArbitrageRequest, ArbitrageResponse, SmartClient};
use crate::observability::{Observer, ObserverEvent, ObserverMetric, create_observer};

/// Owns every long-lived piece of the pipeline.
///
/// Share it behind an `Arc`; [`complete`](Self::complete) takes `&self`.
pub struct ArbitrageEngine {
    client: SmartClient,
    registry: Arc<ModelRegistry>,
    health: Arc<HealthTracker>,
    accountant: Arc<Accountant>,
    foundry: Option<Arc<dyn ModelFoundryClient>>,
    observer: Arc<dyn Observer>,
    config: ArbitrageConfig,
    accepting: AtomicBool,
    started: AtomicBool,
    requests: TaskTracker,
    background: TaskTracker,
    cancel: CancellationToken,
}

impl ArbitrageEngine {
    /// Validate `config` and assemble the pipeline. The observer backend
    /// comes from `config.observability`.
    pub fn new(config: ArbitrageConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        let observer = create_observer(&config.observability);
        Self::new_with_observer(config, collaborators, observer)
    }

    pub fn new_with_observer(
        config: ArbitrageConfig,
        collaborators: Collaborators,
        observer: Arc<dyn Observer>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let registry = Arc::new(ModelRegistry::with_models(config.models.iter().cloned()));
        let policies = PolicyStore::from_config(&config.policies)?;
        let gatekeeper = Gatekeeper::new(&config.gatekeeper)?;
        let router = Router::new(Arc::clone(&registry), policies, config.router.clone());

        let health = Arc::new(HealthTracker::new(config.health.clone()));
        let dispatcher = Dispatcher::new(
            Arc::clone(&collaborators.backend),
            Arc::clone(&health),
            config.dispatch,
        )
        .with_observer(Arc::clone(&observer));

        let accountant = Arc::new(
            Accountant::new(
                Arc::clone(&collaborators.budget),
                Arc::clone(&collaborators.audit),
                config.accountant.clone(),
            )
            .with_observer(Arc::clone(&observer)),
        );

        let client = SmartClient::new(
            gatekeeper,
            router,
            Arc::clone(&health),
            dispatcher,
            Arc::clone(&accountant),
            Arc::clone(&collaborators.budget),
            config.client.clone(),
        )
        .with_observer(Arc::clone(&observer));

        tracing::info!(
            models = registry.len(),
            policies = config.policies.len(),
            observer = observer.name(),
            "Arbitrage engine initialized"
        );

        Ok(Self {
            client,
            registry,
            health,
            accountant,
            foundry: collaborators.foundry,
            observer,
            config,
            accepting: AtomicBool::new(true),
            started: AtomicBool::new(false),
            requests: TaskTracker::new(),
            background: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn client(&self) -> &SmartClient {
        &self.client
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn accountant(&self) -> &Arc<Accountant> {
        &self.accountant
    }

    pub fn config(&self) -> &ArbitrageConfig {
        &self.config
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Pull specialized models and spawn the background loops.
    ///
    /// Foundry failures are logged; the engine starts with whatever models it
    /// has. Calling `start` again is a no-op.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("Arbitrage engine already started");
            return;
        }

        if let Some(foundry) = &self.foundry {
            sync_foundry(&self.registry, foundry.as_ref(), &self.config.foundry.domains).await;
        }

        self.spawn_breaker_sweep();
        self.spawn_reconciliation();
        self.spawn_foundry_poll();

        tracing::info!("Arbitrage engine started");
    }

    /// Serve one request. Rejected with [`ArbitrageError::ShuttingDown`]
    /// once [`shutdown`](Self::shutdown) has begun.
    pub async fn complete(
        &self,
        request: ArbitrageRequest,
    ) -> Result<ArbitrageResponse, ArbitrageError> {
        if !self.is_accepting() {
            return Err(ArbitrageError::ShuttingDown);
        }
        self.requests
            .track_future(self.client.complete(request))
            .await
    }

    /// Stop accepting requests, drain in-flight work, then stop the
    /// background loops.
    ///
    /// In-flight requests get `background.shutdown_grace` to finish.
    /// Settlement tasks are always awaited; each collaborator call inside
    /// them is bounded by `accountant.stage_timeout`, and calls that time
    /// out are left in the reconciliation queue.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!(
            in_flight = self.requests.len(),
            "Arbitrage engine shutting down"
        );

        self.requests.close();
        let grace = self.config.background.shutdown_grace;
        if tokio::time::timeout(grace, self.requests.wait()).await.is_err() {
            tracing::warn!(
                grace_secs = grace.as_secs(),
                remaining = self.requests.len(),
                "In-flight requests did not finish within the shutdown grace period"
            );
        }

        self.accountant.flush().await;

        self.cancel.cancel();
        self.background.close();
        self.background.wait().await;

        // One last pass so transient collaborator failures during the final
        // requests still get a chance to land.
        if self.accountant.pending() > 0 {
            let report = self.accountant.reconcile().await;
            if report.requeued + report.abandoned > 0 {
                tracing::error!(
                    unreconciled = self.accountant.pending(),
                    abandoned = report.abandoned,
                    "Shutting down with unreconciled settlements"
                );
            }
        }

        self.observer.flush();
        tracing::info!("Arbitrage engine stopped");
    }

    fn spawn_breaker_sweep(&self) {
        let health = Arc::clone(&self.health);
        let observer = Arc::clone(&self.observer);
        let period = self.config.background.sweep_interval;
        self.spawn_loop("breaker_sweep", period, move || {
            let health = Arc::clone(&health);
            let observer = Arc::clone(&observer);
            async move {
                for provider in health.sweep() {
                    tracing::info!(provider = %provider, "Provider cooldown elapsed, healthy again");
                    observer.record_event(&ObserverEvent::BreakerRecovered { provider });
                }
            }
        });
    }

    fn spawn_reconciliation(&self) {
        let accountant = Arc::clone(&self.accountant);
        let observer = Arc::clone(&self.observer);
        let period = self.config.background.reconcile_interval;
        self.spawn_loop("reconciliation", period, move || {
            let accountant = Arc::clone(&accountant);
            let observer = Arc::clone(&observer);
            async move {
                if accountant.pending() == 0 {
                    observer.record_metric(&ObserverMetric::ReconciliationDepth(0));
                    return;
                }
                let report = accountant.reconcile().await;
                tracing::debug!(
                    retried = report.retried,
                    succeeded = report.succeeded,
                    requeued = report.requeued,
                    abandoned = report.abandoned,
                    "Reconciliation pass complete"
                );
            }
        });
    }

    fn spawn_foundry_poll(&self) {
        let Some(foundry) = self.foundry.clone() else {
            return;
        };
        let period = self.config.foundry.poll_interval;
        let domains = self.config.foundry.domains.clone();
        if period.is_zero() || domains.is_empty() {
            return;
        }
        let registry = Arc::clone(&self.registry);
        self.spawn_loop("foundry_poll", period, move || {
            let registry = Arc::clone(&registry);
            let foundry = Arc::clone(&foundry);
            let domains = domains.clone();
            async move {
                sync_foundry(&registry, foundry.as_ref(), &domains).await;
            }
        });
    }

    /// Run `tick` every `period` until the engine is cancelled. The first
    /// run happens one full period after spawning.
    fn spawn_loop<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.background.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // Skip immediate tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            tracing::debug!(task = name, "Background task stopped");
        });
    }
}

/// Sync every domain concurrently. A failing domain keeps its existing models.
async fn sync_foundry(registry: &ModelRegistry, foundry: &dyn ModelFoundryClient, domains: &[String]) {
    let syncs = domains.iter().map(|domain| async move {
        (domain, registry.sync_from_foundry(foundry, domain).await)
    });
    for (domain, result) in futures::future::join_all(syncs).await {
        if let Err(e) = result {
            tracing::warn!(domain = %domain, error = %e, "Foundry sync failed, keeping existing models");
        }
    }
}

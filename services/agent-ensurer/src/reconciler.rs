//! Reconciliation loop for keeping the idle agent pool warm.
//!
//! The reconciler:
//! - Probes the server once before entering the loop
//! - Fetches agents, classifies them, then fetches cloud instances
//! - Launches enough instances to cover the deficit
//! - Sleeps for the configured interval, or until shutdown
//!
//! Cycles never overlap. Shutdown is only observed between cycles, so a
//! cycle that has started always runs to completion.

use std::time::Duration;

use chrono::{DateTime, Utc};
use ensurer_reconcile::{classify, count_scheduled, AgentCensus, ReconciliationSnapshot};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::client::{InstanceHandle, ServerApi};
use crate::config::{Config, CycleErrorPolicy};
use crate::error::EnsurerError;

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Cloud profile new instances are started from.
    pub cloud_profile_id: String,

    /// Minimum number of alive idle agents.
    pub min_idle_agents: u32,

    /// Pause between the end of one cycle and the start of the next.
    pub interval: Duration,

    pub on_cycle_error: CycleErrorPolicy,
}

impl From<&Config> for ReconcilerConfig {
    fn from(config: &Config) -> Self {
        Self {
            cloud_profile_id: config.cloud_profile_id.clone(),
            min_idle_agents: config.min_idle_agents,
            interval: config.watch_interval,
            on_cycle_error: config.on_cycle_error,
        }
    }
}

/// Result of one completed cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub snapshot: ReconciliationSnapshot,

    /// One handle per launch issued this cycle.
    pub launched: Vec<InstanceHandle>,
}

/// Reconciler for the idle agent pool.
pub struct Reconciler<A> {
    api: A,
    config: ReconcilerConfig,
}

impl<A: ServerApi> Reconciler<A> {
    /// Create a new reconciler.
    pub fn new(api: A, config: ReconcilerConfig) -> Self {
        Self { api, config }
    }

    /// Access the server API, mainly for tests.
    pub fn api(&self) -> &A {
        &self.api
    }

    /// Check the server is reachable and accepts our credentials.
    pub async fn check_connectivity(&self) -> Result<(), EnsurerError> {
        match self.api.probe().await {
            Ok(()) => {
                info!("Server connection established");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Server connectivity check failed");
                Err(e.into())
            }
        }
    }

    /// Probe the server, then reconcile until shutdown.
    ///
    /// Returns `Ok` on shutdown. Returns `Err` if the probe fails, or if a
    /// cycle fails under [`CycleErrorPolicy::Exit`].
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EnsurerError> {
        self.check_connectivity().await?;

        info!(
            cloud_profile_id = %self.config.cloud_profile_id,
            min_idle_agents = self.config.min_idle_agents,
            interval_secs = self.config.interval.as_secs(),
            on_cycle_error = ?self.config.on_cycle_error,
            "Starting reconciliation loop"
        );

        loop {
            if let Err(e) = self.reconcile().await {
                match self.config.on_cycle_error {
                    CycleErrorPolicy::Continue => {
                        error!(error = %e, "Reconciliation failed, retrying next cycle");
                    }
                    CycleErrorPolicy::Exit => {
                        error!(error = %e, "Reconciliation failed, stopping");
                        return Err(e);
                    }
                }
            }

            debug!(
                interval_secs = self.config.interval.as_secs(),
                "Sleeping until next cycle"
            );
            let stop = tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => *shutdown.borrow(),
                // A dropped sender means nobody can ask us to stop any more.
                changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
            };

            if stop {
                info!("Reconciler shutting down");
                return Ok(());
            }
        }
    }

    /// Perform a single reconciliation pass at the current time.
    pub async fn reconcile(&self) -> Result<CycleOutcome, EnsurerError> {
        self.reconcile_at(Utc::now()).await
    }

    /// Perform a single reconciliation pass, judging liveness at `now`.
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Result<CycleOutcome, EnsurerError> {
        let agents = self.api.fetch_agents().await?;
        let mut census = AgentCensus::default();
        for agent in &agents {
            let liveness = classify(agent, now)?;
            debug!(agent = %agent.label(), liveness = ?liveness, "Classified agent");
            census.record(liveness);
        }

        let instances = self.api.fetch_cloud_instances().await?;
        let scheduled = count_scheduled(&instances);

        let snapshot = ReconciliationSnapshot::new(census, scheduled, self.config.min_idle_agents);
        info!(
            idle = snapshot.idle,
            alive = snapshot.alive_idle,
            pending = snapshot.scheduled,
            target = snapshot.target,
            "Agents: {} idle ({} alive), {} pending. Target: {}",
            snapshot.idle,
            snapshot.alive_idle,
            snapshot.scheduled,
            snapshot.target
        );

        let launched = self.launch(snapshot.deficit).await?;
        Ok(CycleOutcome { snapshot, launched })
    }

    /// Issue `count` launches; the first failure aborts the rest.
    async fn launch(&self, count: u32) -> Result<Vec<InstanceHandle>, EnsurerError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        info!(
            count,
            cloud_profile_id = %self.config.cloud_profile_id,
            "Starting {} agents",
            count
        );

        let mut launched = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let handle = self
                .api
                .launch_instance(&self.config.cloud_profile_id)
                .await?;
            launched.push(handle);
        }
        Ok(launched)
    }
}

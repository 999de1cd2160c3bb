use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::action::{Action, ActionRegistry, EventSource, InfoCache, RegistryError};
use crate::choice::{ChoiceError, WeightedChoice};
use crate::config::EntitiesConfig;
use crate::entity::{run_entity, EntityConfig, EntityExit, StatusPoll};
use crate::status::Report;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("invalid action table: {0}")]
    Choice(#[from] ChoiceError),
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub entities: u64,
    pub action_rate: Duration,
    pub action_variance: Duration,
    pub max_restarts: Option<u32>,
}

impl From<&EntitiesConfig> for SchedulerSettings {
    fn from(config: &EntitiesConfig) -> Self {
        Self {
            entities: config.count,
            action_rate: config.action_rate(),
            action_variance: config.action_variance(),
            max_restarts: config.max_restarts,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub entities: u64,
    pub restarts: u64,
    /// Entity task groups whose supervisor itself failed
    pub lost: u64,
}

/// Launches one task group per simulated user and joins them all once the
/// stop token fires.
pub struct EntityScheduler {
    settings: SchedulerSettings,
    actions: Arc<Vec<WeightedChoice<Arc<dyn Action>>>>,
    status_poll: Option<StatusPoll>,
    events: Option<Arc<dyn EventSource>>,
    cache: InfoCache,
}

impl EntityScheduler {
    pub fn new(
        settings: SchedulerSettings,
        registry: &ActionRegistry,
        weights: &[(String, u32)],
    ) -> Result<Self, SchedulerError> {
        let actions = registry.weighted(weights)?;
        if actions.is_empty() {
            return Err(ChoiceError::Empty.into());
        }
        if actions.iter().all(|c| c.weight == 0) {
            return Err(ChoiceError::ZeroWeight.into());
        }

        Ok(Self {
            settings,
            actions: Arc::new(actions),
            status_poll: None,
            events: None,
            cache: InfoCache::default(),
        })
    }

    pub fn with_status_poll(mut self, action: Arc<dyn Action>, interval: Duration) -> Self {
        self.status_poll = Some(StatusPoll { action, interval });
        self
    }

    pub fn with_event_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.events = Some(source);
        self
    }

    pub fn cache(&self) -> &InfoCache {
        &self.cache
    }

    /// Run entities `start_num..start_num + entities` until `stop` fires.
    ///
    /// Consumes `reports`; once this returns every entity sender has been
    /// dropped, so the reporter sees its intake close.
    pub async fn run(
        self,
        start_num: u64,
        seed: u64,
        reports: mpsc::Sender<Report>,
        stop: CancellationToken,
    ) -> SchedulerReport {
        let mut set = JoinSet::new();
        for offset in 0..self.settings.entities {
            let config = EntityConfig {
                entity_num: start_num + offset,
                seed,
                actions: Arc::clone(&self.actions),
                action_rate: self.settings.action_rate,
                action_variance: self.settings.action_variance,
                status_poll: self.status_poll.clone(),
                events: self.events.clone(),
                max_restarts: self.settings.max_restarts,
                cache: Arc::clone(&self.cache),
                reports: reports.clone(),
            };
            set.spawn(run_entity(config, stop.clone()));
        }
        drop(reports);

        info!(
            entities = self.settings.entities,
            first = start_num,
            last = start_num + self.settings.entities.saturating_sub(1),
            "entities launched"
        );

        let mut report = SchedulerReport {
            entities: self.settings.entities,
            ..SchedulerReport::default()
        };
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(EntityExit { restarts, .. }) => report.restarts += u64::from(restarts),
                Err(e) => {
                    error!("entity supervisor failed: {e}");
                    report.lost += 1;
                }
            }
        }

        info!(
            entities = report.entities,
            restarts = report.restarts,
            lost = report.lost,
            "all entities stopped"
        );
        report
    }
}

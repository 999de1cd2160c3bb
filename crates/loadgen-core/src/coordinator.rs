//! Instance coordination through a shared store.
//!
//! Every load-generator process registers a row in the shared instances
//! table and receives the smallest free index. The index determines the
//! block of entity numbers the process simulates, so two live instances
//! never drive the same virtual users. The `created_at` of whichever
//! instance holds index 0 is the fleet-wide random seed.
//!
//! Index 0 is authoritative without any fencing: if the index-0 instance is
//! replaced, the seed changes and the fleet has to be restarted together to
//! stay consistent. The heartbeat loop logs an error when it observes this.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::InstanceConfig;
use crate::store::{InstanceStore, StoreError};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to register instance after {attempts} attempts")]
    RegistrationExhausted { attempts: u32 },
    #[error("no instance holds index 0; cannot derive the fleet seed")]
    SeedUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Starting,
    Registered,
    Heartbeating,
    Closing,
    Closed,
    /// The row disappeared while running, most likely pruned by a peer.
    Lost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub index: u32,
    /// First entity number owned by this instance
    pub entity_start_num: u64,
    pub seed: u64,
    pub created_at: DateTime<Utc>,
    pub active_at: DateTime<Utc>,
}

impl Instance {
    /// Reproducible RNG shared by every instance of the fleet for `stream`.
    ///
    /// Entity `n` draws its first-generation stream from `rng_for(n)`, so any
    /// instance can replay another instance's random decisions.
    pub fn rng_for(&self, stream: u64) -> StdRng {
        seeded_rng(self.seed, stream)
    }
}

pub fn seeded_rng(seed: u64, stream: u64) -> StdRng {
    StdRng::seed_from_u64(mix_seed(seed, stream))
}

/// Combine the fleet seed with a stream number (splitmix64 finaliser).
pub fn mix_seed(seed: u64, stream: u64) -> u64 {
    let mut z = seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub heartbeat_interval: Duration,
    pub expiry_multiplier: u32,
    pub entities_per_instance: u64,
    pub max_register_attempts: u32,
    pub register_backoff: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &InstanceConfig, entities_per_instance: u64) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            expiry_multiplier: config.expiry_multiplier,
            entities_per_instance,
            max_register_attempts: config.max_register_attempts,
            register_backoff: Duration::from_millis(config.register_backoff_ms),
        }
    }

    /// Age after which a silent peer is presumed dead.
    pub fn expiry(&self) -> Duration {
        self.heartbeat_interval * self.expiry_multiplier
    }
}

#[derive(Clone)]
pub struct InstanceCoordinator {
    store: Arc<dyn InstanceStore>,
    settings: CoordinatorSettings,
}

impl InstanceCoordinator {
    pub fn new(store: Arc<dyn InstanceStore>, settings: CoordinatorSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Delete peers whose last heartbeat is older than the expiry window.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<u64, CoordinatorError> {
        let expiry = chrono::Duration::from_std(self.settings.expiry())
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(expiry).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let pruned = self.store.prune_older_than(cutoff).await?;
        if pruned > 0 {
            info!(pruned, "pruned expired instances");
        }
        Ok(pruned)
    }

    /// Claim an index and derive the fleet seed.
    pub async fn register(&self) -> Result<Instance, CoordinatorError> {
        let id = Uuid::new_v4().to_string();
        self.prune(Utc::now()).await?;

        let attempts = self.settings.max_register_attempts.max(1);
        let mut attempt = 0u32;
        let record = loop {
            attempt += 1;
            match self.store.insert_with_next_index(&id, Utc::now()).await {
                Ok(record) => break record,
                Err(e) if e.is_conflict() && attempt < attempts => {
                    let backoff = self.settings.register_backoff * attempt;
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "index conflict during registration: {e}"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) if e.is_conflict() => {
                    error!(attempts, "giving up on registration: {e}");
                    return Err(CoordinatorError::RegistrationExhausted { attempts });
                }
                Err(e) => return Err(e.into()),
            }
        };

        let seed = match self.seed().await {
            Ok(seed) => seed,
            Err(e) => {
                if let Err(del) = self.store.delete(&id).await {
                    warn!("failed to remove instance row after seed error: {del}");
                }
                return Err(e);
            }
        };

        let instance = Instance {
            entity_start_num: u64::from(record.index) * self.settings.entities_per_instance,
            id: record.id,
            index: record.index,
            seed,
            created_at: record.created_at,
            active_at: record.active_at,
        };

        info!(
            instance_id = %instance.id,
            index = instance.index,
            entity_start_num = instance.entity_start_num,
            seed = instance.seed,
            "instance registered"
        );
        Ok(instance)
    }

    /// The fleet seed: `created_at` of the index-0 instance in unix millis.
    pub async fn seed(&self) -> Result<u64, CoordinatorError> {
        let created = self
            .store
            .leader_created_at()
            .await?
            .ok_or(CoordinatorError::SeedUnavailable)?;
        Ok(created.timestamp_millis() as u64)
    }

    pub async fn deregister(&self, id: &str) -> Result<bool, CoordinatorError> {
        let removed = self.store.delete(id).await?;
        info!(instance_id = %id, removed, "instance deregistered");
        Ok(removed)
    }

    /// Refresh `active_at` every heartbeat interval until `stop` fires, then
    /// delete the row. Write failures are logged and retried next tick.
    pub fn spawn_heartbeat(
        &self,
        instance: &Instance,
        stop: CancellationToken,
    ) -> JoinHandle<InstanceState> {
        let coordinator = self.clone();
        let id = instance.id.clone();
        let seed = instance.seed;
        tokio::spawn(async move { coordinator.heartbeat_loop(id, seed, stop).await })
    }

    async fn heartbeat_loop(&self, id: String, seed: u64, stop: CancellationToken) -> InstanceState {
        let mut interval = tokio::time::interval(self.settings.heartbeat_interval);
        // first tick completes immediately; registration already set active_at
        interval.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    match self.store.touch(&id, Utc::now()).await {
                        Ok(true) => {}
                        Ok(false) => {
                            error!(instance_id = %id, "instance row missing, presumed pruned by a peer");
                            return InstanceState::Lost;
                        }
                        Err(e) => {
                            warn!(instance_id = %id, "heartbeat failed: {e}");
                            continue;
                        }
                    }
                    self.check_seed(seed).await;
                }
            }
        }

        info!(instance_id = %id, state = ?InstanceState::Closing, "stopping heartbeat");
        if let Err(e) = self.store.delete(&id).await {
            warn!(instance_id = %id, "failed to deregister instance: {e}");
        }
        InstanceState::Closed
    }

    async fn check_seed(&self, seed: u64) {
        match self.seed().await {
            Ok(current) if current != seed => error!(
                expected = seed,
                current,
                "index-0 instance was replaced; fleet seed changed, restart all instances"
            ),
            Ok(_) => {}
            Err(CoordinatorError::SeedUnavailable) => {
                warn!("no instance holds index 0; fleet seed cannot be verified")
            }
            Err(e) => warn!("seed check failed: {e}"),
        }
    }
}

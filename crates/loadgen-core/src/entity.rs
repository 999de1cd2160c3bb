//! Per-entity task group.
//!
//! A simulated user runs up to three tasks sharing one stop token: the
//! action loop, an optional status poll and an optional event listener.
//! Each task runs under a supervisor that respawns it when it panics, so a
//! misbehaving user never takes the rest of the run down with it.

use futures::StreamExt;
use rand::rngs::StdRng;
use rand::Rng;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::action::{Action, EntityContext, EventSource, InfoCache};
use crate::choice::{choose, WeightedChoice};
use crate::coordinator::seeded_rng;
use crate::stats::is_success;
use crate::status::{Report, StatusCode, TimingSample};

/// Delay before the event listener reconnects after its stream ends.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct StatusPoll {
    pub action: Arc<dyn Action>,
    pub interval: Duration,
}

/// Launch parameters of one simulated user.
#[derive(Clone)]
pub struct EntityConfig {
    pub entity_num: u64,
    /// Fleet seed; mixed with the entity number for the entity's own RNG
    pub seed: u64,
    pub actions: Arc<Vec<WeightedChoice<Arc<dyn Action>>>>,
    pub action_rate: Duration,
    pub action_variance: Duration,
    pub status_poll: Option<StatusPoll>,
    pub events: Option<Arc<dyn EventSource>>,
    /// Respawns allowed per task; `None` keeps respawning until stopped
    pub max_restarts: Option<u32>,
    pub cache: InfoCache,
    pub reports: mpsc::Sender<Report>,
}

impl EntityConfig {
    async fn report(&self, report: Report) {
        // the reporter only goes away after every sender is dropped
        let _ = self.reports.send(report).await;
    }

    fn context(&self) -> EntityContext {
        EntityContext::new(self.entity_num, self.cache.clone())
    }

    fn rng(&self, generation: u32) -> StdRng {
        seeded_rng(self.seed, rng_stream(self.entity_num, generation))
    }
}

/// Random stream of an entity task; a respawn moves to the next generation.
fn rng_stream(entity_num: u64, generation: u32) -> u64 {
    entity_num ^ (u64::from(generation) << 48)
}

/// Outcome of an entity's task group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityExit {
    pub entity_num: u64,
    pub restarts: u32,
}

/// Delay until a random phase of the repeating `rate` window, measured on
/// the wall clock so entities launched in a burst spread out across the
/// window instead of firing together.
pub fn initial_delay<R: Rng>(now_ms: u64, rate: Duration, rng: &mut R) -> Duration {
    let rate_ms = rate.as_millis() as u64;
    if rate_ms == 0 {
        return Duration::ZERO;
    }
    let phase = rng.random_range(0..rate_ms);
    let now_phase = now_ms % rate_ms;
    Duration::from_millis((phase + rate_ms - now_phase) % rate_ms)
}

/// `rate` shifted by a uniform offset in `[-variance, +variance]`.
pub fn jittered_interval<R: Rng>(rate: Duration, variance: Duration, rng: &mut R) -> Duration {
    let variance_ms = variance.as_millis() as i64;
    if variance_ms == 0 {
        return rate;
    }
    let offset = rng.random_range(-variance_ms..=variance_ms);
    let ms = (rate.as_millis() as i64 + offset).max(0);
    Duration::from_millis(ms as u64)
}

/// Next fire time anchored on the previous schedule rather than on when
/// the action finished; an entity that fell behind fires immediately.
pub fn next_deadline(scheduled: Instant, now: Instant, interval: Duration) -> Instant {
    let next = scheduled + interval;
    if next < now {
        now
    } else {
        next
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run all tasks of one entity until `stop` fires.
pub async fn run_entity(config: EntityConfig, stop: CancellationToken) -> EntityExit {
    let entity_num = config.entity_num;

    let actions = supervise(&config, "actions", &stop, {
        let config = config.clone();
        let stop = stop.clone();
        move |generation| run_actions(config.clone(), generation, stop.clone())
    });

    let poll = async {
        match config.status_poll.clone() {
            Some(poll) => {
                supervise(&config, "status", &stop, {
                    let config = config.clone();
                    let stop = stop.clone();
                    move |_| run_status_poll(config.clone(), poll.clone(), stop.clone())
                })
                .await
            }
            None => 0,
        }
    };

    let listen = async {
        match config.events.clone() {
            Some(source) => {
                supervise(&config, "events", &stop, {
                    let config = config.clone();
                    let stop = stop.clone();
                    move |_| run_event_listener(config.clone(), source.clone(), stop.clone())
                })
                .await
            }
            None => 0,
        }
    };

    let (a, b, c) = tokio::join!(actions, poll, listen);
    config
        .report(Report::status(entity_num, StatusCode::Stopped, ""))
        .await;
    debug!(entity_num, "entity stopped");

    EntityExit {
        entity_num,
        restarts: a + b + c,
    }
}

/// Run `make(generation)` as its own task and start a fresh one whenever
/// it panics. Returns the number of respawns.
async fn supervise<F, Fut>(
    config: &EntityConfig,
    role: &'static str,
    stop: &CancellationToken,
    mut make: F,
) -> u32
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let entity_num = config.entity_num;
    let mut restarts = 0u32;

    loop {
        let outcome = tokio::spawn(make(restarts)).await;
        let join_err = match outcome {
            Ok(()) => return restarts,
            Err(e) => e,
        };
        if !join_err.is_panic() {
            warn!(entity_num, role, "entity task cancelled");
            return restarts;
        }

        let message = panic_message(join_err.into_panic());
        error!(entity_num, role, "entity task panicked: {message}");
        config
            .report(Report::error(
                entity_num,
                StatusCode::Failed,
                format!("{role} task panicked: {message}"),
            ))
            .await;

        if stop.is_cancelled() {
            return restarts;
        }
        if let Some(max) = config.max_restarts {
            if restarts >= max {
                error!(entity_num, role, max, "restart limit reached, entity task abandoned");
                return restarts;
            }
        }
        restarts += 1;
        info!(entity_num, role, restarts, "respawning entity task");
    }
}

async fn run_actions(config: EntityConfig, generation: u32, stop: CancellationToken) {
    let entity_num = config.entity_num;
    let mut rng = config.rng(generation);
    let ctx = config.context();

    config
        .report(Report::status(entity_num, StatusCode::Launching, ""))
        .await;

    let delay = initial_delay(wall_clock_ms(), config.action_rate, &mut rng);
    let mut scheduled = Instant::now() + delay;
    let mut active = false;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = sleep_until(scheduled) => {}
        }

        if !active {
            config
                .report(Report::status(entity_num, StatusCode::Active, ""))
                .await;
            active = true;
        }

        let action = match choose(&config.actions, &mut rng) {
            Ok(action) => Arc::clone(action),
            Err(e) => {
                error!(entity_num, "no action to run: {e}");
                config
                    .report(Report::error(entity_num, StatusCode::Error, e))
                    .await;
                return;
            }
        };

        config
            .report(Report::status(entity_num, StatusCode::ActionSent, action.name()))
            .await;

        let started = Instant::now();
        let result = action.run(&ctx).await;
        let elapsed = started.elapsed();

        match result {
            Ok(outcome) => {
                config
                    .report(Report::Timing(TimingSample::new(
                        entity_num,
                        outcome.route.clone(),
                        elapsed,
                        outcome.status,
                    )))
                    .await;
                let report = if is_success(outcome.status) {
                    Report::status(entity_num, StatusCode::ActionReceived, outcome.route)
                } else {
                    Report::error(
                        entity_num,
                        StatusCode::Error,
                        format!("{} returned {}", outcome.route, outcome.status),
                    )
                };
                config.report(report).await;
            }
            Err(e) => {
                config
                    .report(Report::Timing(TimingSample::new(
                        entity_num,
                        action.name(),
                        elapsed,
                        0,
                    )))
                    .await;
                config
                    .report(Report::error(
                        entity_num,
                        StatusCode::Error,
                        format!("{}: {e:#}", action.name()),
                    ))
                    .await;
            }
        }

        let interval = jittered_interval(config.action_rate, config.action_variance, &mut rng);
        scheduled = next_deadline(scheduled, Instant::now(), interval);
    }
}

async fn run_status_poll(config: EntityConfig, poll: StatusPoll, stop: CancellationToken) {
    let entity_num = config.entity_num;
    let ctx = config.context();
    let mut interval = tokio::time::interval(poll.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = interval.tick() => {}
        }

        let started = Instant::now();
        let result = poll.action.run(&ctx).await;
        let elapsed = started.elapsed();
        match result {
            Ok(outcome) => {
                config
                    .report(Report::Timing(TimingSample::new(
                        entity_num,
                        outcome.route,
                        elapsed,
                        outcome.status,
                    )))
                    .await;
            }
            Err(e) => {
                config
                    .report(Report::Timing(TimingSample::new(
                        entity_num,
                        poll.action.name(),
                        elapsed,
                        0,
                    )))
                    .await;
                config
                    .report(Report::error(
                        entity_num,
                        StatusCode::Error,
                        format!("status poll: {e:#}"),
                    ))
                    .await;
            }
        }
    }
}

async fn run_event_listener(
    config: EntityConfig,
    source: Arc<dyn EventSource>,
    stop: CancellationToken,
) {
    let entity_num = config.entity_num;
    let ctx = config.context();

    loop {
        {
            let mut events = source.connect(&ctx);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return,
                    next = events.next() => match next {
                        Some(Ok(event)) => {
                            config
                                .report(Report::status(entity_num, StatusCode::ActionReceived, event))
                                .await;
                        }
                        Some(Err(e)) => {
                            config
                                .report(Report::error(
                                    entity_num,
                                    StatusCode::Error,
                                    format!("event stream: {e:#}"),
                                ))
                                .await;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = sleep(RECONNECT_DELAY) => {}
        }
    }
}

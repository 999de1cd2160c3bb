use loadgen_core::{
    report_channel, ActionRegistry, CoordinatorSettings, EntityScheduler, Instance,
    InstanceCoordinator, InstanceState, InstanceStore, MemoryInstanceStore, MockAction,
    ReportSummary, ReporterSettings, SchedulerSettings, SqliteInstanceStore, StatusCode,
    StatusReporter, TimingAggregator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ENTITIES: u64 = 3;

fn coordinator_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        heartbeat_interval: Duration::from_millis(20),
        expiry_multiplier: 4,
        entities_per_instance: ENTITIES,
        max_register_attempts: 5,
        register_backoff: Duration::from_millis(5),
    }
}

fn registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    registry
        .register(Arc::new(MockAction::new(
            "view_channel",
            "/api/v4/channels/{id}/stats",
            Duration::from_millis(1),
        )))
        .register(Arc::new(
            MockAction::new("post", "/api/v4/posts", Duration::from_millis(2)).with_error_rate(0.2),
        ));
    registry
}

/// Drive one instance's entities for `ms` with a real reporter.
async fn run_instance(instance: &Instance, ms: u64) -> ReportSummary {
    let scheduler = EntityScheduler::new(
        SchedulerSettings {
            entities: ENTITIES,
            action_rate: Duration::from_millis(10),
            action_variance: Duration::from_millis(3),
            max_restarts: None,
        },
        &registry(),
        &[("view_channel".into(), 3), ("post".into(), 1)],
    )
    .unwrap();

    let (tx, rx) = report_channel();
    let reporter = StatusReporter::new(ReporterSettings::default()).spawn(rx);
    let stop = CancellationToken::new();
    let run = tokio::spawn(scheduler.run(instance.entity_start_num, instance.seed, tx, stop.clone()));

    tokio::time::sleep(Duration::from_millis(ms)).await;
    stop.cancel();

    let report = run.await.unwrap();
    assert_eq!(report.lost, 0);
    reporter.await.unwrap()
}

#[tokio::test]
async fn test_fleet_partitions_entities_and_merges_results() {
    let store: Arc<dyn InstanceStore> = Arc::new(MemoryInstanceStore::new());
    let coordinator = InstanceCoordinator::new(store.clone(), coordinator_settings());

    let mut instances = Vec::new();
    for _ in 0..3 {
        instances.push(coordinator.register().await.unwrap());
    }

    let seed = instances[0].seed;
    assert!(instances.iter().all(|i| i.seed == seed));
    let mut starts: Vec<u64> = instances.iter().map(|i| i.entity_start_num).collect();
    starts.sort_unstable();
    assert_eq!(starts, vec![0, ENTITIES, 2 * ENTITIES]);

    let stop = CancellationToken::new();
    let heartbeats: Vec<_> = instances
        .iter()
        .map(|i| coordinator.spawn_heartbeat(i, stop.clone()))
        .collect();

    let summaries = futures::future::join_all(instances.iter().map(|i| run_instance(i, 120))).await;

    stop.cancel();
    for hb in heartbeats {
        assert_eq!(hb.await.unwrap(), InstanceState::Closed);
    }
    assert!(store.list().await.unwrap().is_empty());

    for summary in &summaries {
        assert!(summary.timings.total_hits() > 0);
        assert_eq!(summary.count(StatusCode::Stopped), ENTITIES);
        assert_eq!(summary.count(StatusCode::Failed), 0);
    }

    // ids in routes collapse, so every instance reports the same two routes
    for summary in &summaries {
        let routes: Vec<&str> = summary.timings.routes.keys().map(String::as_str).collect();
        assert!(routes.contains(&"/api/v4/channels/:id/stats"));
    }

    let merged = summaries
        .iter()
        .fold(TimingAggregator::new(), |acc, s| acc.merge(&s.timings));
    let hits: u64 = summaries.iter().map(|s| s.timings.total_hits()).sum();
    let errors: u64 = summaries.iter().map(|s| s.timings.total_errors()).sum();
    assert_eq!(merged.total_hits(), hits);
    assert_eq!(merged.total_errors(), errors);

    // fold order does not matter
    let reversed = summaries
        .iter()
        .rev()
        .fold(TimingAggregator::new(), |acc, s| acc.merge(&s.timings));
    for (route, stats) in &merged.routes {
        let other = &reversed.routes[route];
        assert_eq!(stats.hits, other.hits);
        assert_eq!(stats.results, other.results);
    }
    assert!(merged.score() > 0.0);
}

#[tokio::test]
async fn test_sqlite_fleet_registration() {
    let store = SqliteInstanceStore::connect("sqlite::memory:", 1).await.unwrap();
    let store: Arc<dyn InstanceStore> = Arc::new(store);
    let coordinator = InstanceCoordinator::new(store.clone(), coordinator_settings());

    let first = coordinator.register().await.unwrap();
    let second = coordinator.register().await.unwrap();
    assert_eq!(first.index, 0);
    assert_eq!(second.index, 1);
    assert_eq!(second.entity_start_num, ENTITIES);
    assert_eq!(first.seed, first.created_at.timestamp_millis() as u64);
    assert_eq!(second.seed, first.seed);

    // a departed instance's index is handed out again
    assert!(coordinator.deregister(&second.id).await.unwrap());
    let third = coordinator.register().await.unwrap();
    assert_eq!(third.index, 1);

    // both instances derive the same global random stream
    use rand::Rng;
    let a: u64 = first.rng_for(7).random();
    let b: u64 = third.rng_for(7).random();
    assert_eq!(a, b);

    let stop = CancellationToken::new();
    let hb = coordinator.spawn_heartbeat(&first, stop.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.cancel();
    assert_eq!(hb.await.unwrap(), InstanceState::Closed);

    let left: Vec<u32> = store.list().await.unwrap().iter().map(|r| r.index).collect();
    assert_eq!(left, vec![1]);
}

#[tokio::test]
async fn test_simultaneous_workers_on_shared_file_register_first_try() {
    let path = std::env::temp_dir().join(format!("loadgen-fleet-{}.db", uuid::Uuid::new_v4()));
    let url = format!("sqlite://{}", path.display());

    let mut coordinators = Vec::new();
    for _ in 0..12 {
        let store = SqliteInstanceStore::connect(&url, 2).await.unwrap();
        coordinators.push(InstanceCoordinator::new(
            Arc::new(store),
            CoordinatorSettings {
                max_register_attempts: 1,
                ..coordinator_settings()
            },
        ));
    }

    let registered =
        futures::future::join_all(coordinators.iter().map(|c| c.register())).await;
    let instances: Vec<Instance> = registered.into_iter().map(|r| r.unwrap()).collect();

    let mut indices: Vec<u32> = instances.iter().map(|i| i.index).collect();
    indices.sort_unstable();
    assert_eq!(indices, (0..12).collect::<Vec<u32>>());
    assert!(instances.iter().all(|i| i.seed == instances[0].seed));

    for (coordinator, instance) in coordinators.iter().zip(&instances) {
        assert!(coordinator.deregister(&instance.id).await.unwrap());
    }
    drop(coordinators);
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

use loadgen_core::{
    Action, ActionFuture, ActionOutcome, ActionRegistry, EntityContext, EntityScheduler,
    MockAction, Report, SchedulerSettings, StatusCode,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Panics on the first call made by `target`, then behaves normally.
struct PanicOnce {
    target: u64,
    fired: AtomicBool,
    calls: AtomicUsize,
}

impl Action for PanicOnce {
    fn name(&self) -> &str {
        "flaky"
    }

    fn run<'a>(&'a self, ctx: &'a EntityContext) -> ActionFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if ctx.entity_num == self.target && !self.fired.swap(true, Ordering::SeqCst) {
                panic!("simulated crash");
            }
            Ok(ActionOutcome {
                route: "/api/v4/flaky".to_string(),
                status: 200,
            })
        })
    }
}

fn settings(entities: u64) -> SchedulerSettings {
    SchedulerSettings {
        entities,
        action_rate: Duration::from_millis(10),
        action_variance: Duration::from_millis(2),
        max_restarts: None,
    }
}

async fn run_for(
    scheduler: EntityScheduler,
    start_num: u64,
    ms: u64,
) -> (loadgen_core::SchedulerReport, Vec<Report>) {
    let (tx, mut rx) = mpsc::channel(4096);
    let stop = CancellationToken::new();
    let collect = tokio::spawn(async move {
        let mut out = Vec::new();
        while let Some(report) = rx.recv().await {
            out.push(report);
        }
        out
    });

    let run = tokio::spawn(scheduler.run(start_num, 99, tx, stop.clone()));
    tokio::time::sleep(Duration::from_millis(ms)).await;
    stop.cancel();

    let report = run.await.unwrap();
    (report, collect.await.unwrap())
}

fn statuses(reports: &[Report], entity_num: u64, code: StatusCode) -> usize {
    reports
        .iter()
        .filter(|r| matches!(r, Report::Status(s) if s.entity_num == entity_num && s.code == code))
        .count()
}

#[tokio::test]
async fn test_panicking_action_is_isolated_and_respawned() {
    let flaky = Arc::new(PanicOnce {
        target: 1,
        fired: AtomicBool::new(false),
        calls: AtomicUsize::new(0),
    });
    let mut registry = ActionRegistry::new();
    registry.register(flaky.clone());
    let scheduler = EntityScheduler::new(settings(2), &registry, &[("flaky".into(), 1)]).unwrap();

    let (report, reports) = run_for(scheduler, 0, 200).await;

    assert_eq!(report.entities, 2);
    assert_eq!(report.restarts, 1);
    assert_eq!(report.lost, 0);

    // exactly one failure, on the crashing entity only
    assert_eq!(statuses(&reports, 1, StatusCode::Failed), 1);
    assert_eq!(statuses(&reports, 0, StatusCode::Failed), 0);

    // the respawned task launched again and kept acting
    assert_eq!(statuses(&reports, 1, StatusCode::Launching), 2);
    assert!(statuses(&reports, 1, StatusCode::ActionReceived) > 0);

    // the sibling never restarted
    assert_eq!(statuses(&reports, 0, StatusCode::Launching), 1);
    assert!(statuses(&reports, 0, StatusCode::ActionReceived) > 0);

    assert_eq!(statuses(&reports, 0, StatusCode::Stopped), 1);
    assert_eq!(statuses(&reports, 1, StatusCode::Stopped), 1);

    let failure = reports.iter().find_map(|r| match r {
        Report::Status(s) if s.code == StatusCode::Failed => s.error.clone(),
        _ => None,
    });
    assert!(failure.unwrap().contains("simulated crash"));
    assert!(flaky.calls.load(Ordering::SeqCst) > 2);
}

#[tokio::test]
async fn test_restart_limit_abandons_action_loop() {
    struct AlwaysPanics;
    impl Action for AlwaysPanics {
        fn name(&self) -> &str {
            "boom"
        }
        fn run<'a>(&'a self, _ctx: &'a EntityContext) -> ActionFuture<'a> {
            Box::pin(async move { crash() })
        }
    }

    fn crash() -> anyhow::Result<ActionOutcome> {
        panic!("always")
    }

    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(AlwaysPanics));
    let scheduler = EntityScheduler::new(
        SchedulerSettings {
            max_restarts: Some(2),
            ..settings(1)
        },
        &registry,
        &[("boom".into(), 1)],
    )
    .unwrap();

    let (report, reports) = run_for(scheduler, 5, 200).await;

    assert_eq!(report.restarts, 2);
    assert_eq!(report.lost, 0);
    // the initial run plus two respawns, each ending in a failure
    assert_eq!(statuses(&reports, 5, StatusCode::Failed), 3);
    assert_eq!(statuses(&reports, 5, StatusCode::Launching), 3);
    assert_eq!(statuses(&reports, 5, StatusCode::Stopped), 1);
}

#[tokio::test]
async fn test_actions_of_one_entity_never_overlap() {
    struct Exclusive {
        in_flight: AtomicBool,
        overlaps: AtomicUsize,
    }
    impl Action for Exclusive {
        fn name(&self) -> &str {
            "slow"
        }
        fn run<'a>(&'a self, _ctx: &'a EntityContext) -> ActionFuture<'a> {
            Box::pin(async move {
                if self.in_flight.swap(true, Ordering::SeqCst) {
                    self.overlaps.fetch_add(1, Ordering::SeqCst);
                }
                // longer than the action interval
                tokio::time::sleep(Duration::from_millis(25)).await;
                self.in_flight.store(false, Ordering::SeqCst);
                Ok(ActionOutcome {
                    route: "/slow".to_string(),
                    status: 200,
                })
            })
        }
    }

    let action = Arc::new(Exclusive {
        in_flight: AtomicBool::new(false),
        overlaps: AtomicUsize::new(0),
    });
    let mut registry = ActionRegistry::new();
    registry.register(action.clone());
    let scheduler = EntityScheduler::new(settings(1), &registry, &[("slow".into(), 1)]).unwrap();

    let (_, reports) = run_for(scheduler, 0, 150).await;

    assert_eq!(action.overlaps.load(Ordering::SeqCst), 0);
    assert!(statuses(&reports, 0, StatusCode::ActionReceived) >= 2);
}

#[tokio::test]
async fn test_status_poll_and_events_run_beside_actions() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(MockAction::new("view", "/view/{id}", Duration::ZERO)));
    let scheduler = EntityScheduler::new(settings(1), &registry, &[("view".into(), 1)])
        .unwrap()
        .with_status_poll(
            Arc::new(MockAction::new("status", "/status", Duration::ZERO)),
            Duration::from_millis(15),
        )
        .with_event_source(Arc::new(loadgen_core::MockEventSource {
            every: Duration::from_millis(5),
            count: 2,
        }));

    let (report, reports) = run_for(scheduler, 3, 120).await;
    assert_eq!(report.restarts, 0);

    let status_samples = reports
        .iter()
        .filter(|r| matches!(r, Report::Timing(t) if t.route == "/status"))
        .count();
    assert!(status_samples >= 2);
    assert!(statuses(&reports, 3, StatusCode::ActionReceived) > 0);
}

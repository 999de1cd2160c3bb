use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::stats::TimingAggregator;
use crate::status::{Report, StatusCode, UserStatus};

/// Capacity of the report channel shared by all entity tasks.
pub const REPORT_CHANNEL_CAPACITY: usize = 10_000;

pub fn report_channel() -> (mpsc::Sender<Report>, mpsc::Receiver<Report>) {
    mpsc::channel(REPORT_CHANNEL_CAPACITY)
}

#[derive(Debug, Clone)]
pub struct ReporterSettings {
    pub print_every: Duration,
    /// Append every status event as a JSON line
    pub status_log: Option<PathBuf>,
    /// Most recent error lines kept for the summary
    pub keep_errors: usize,
    /// Minimum age of the score shown in progress lines before it is
    /// recomputed from the raw samples
    pub score_every: Duration,
}

impl Default for ReporterSettings {
    fn default() -> Self {
        Self {
            print_every: Duration::from_secs(5),
            status_log: None,
            keep_errors: 20,
            score_every: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportSummary {
    pub timings: TimingAggregator,
    pub status_counts: BTreeMap<StatusCode, u64>,
    pub recent_errors: Vec<String>,
    pub score: f64,
    pub duration_ms: u64,
}

impl ReportSummary {
    pub fn count(&self, code: StatusCode) -> u64 {
        self.status_counts.get(&code).copied().unwrap_or(0)
    }
}

/// Sole owner of the route statistics; drains the report channel until
/// every sender has been dropped.
pub struct StatusReporter {
    settings: ReporterSettings,
    timings: TimingAggregator,
    status_counts: BTreeMap<StatusCode, u64>,
    recent_errors: VecDeque<String>,
    log: Option<BufWriter<File>>,
    start_time: Instant,
    last_score: f64,
    scored_at: Option<Instant>,
}

/// Counters shown in one progress line.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Progress {
    hits: u64,
    errors: u64,
    rate: u64,
    routes: usize,
    active: u64,
    failed: u64,
    /// Score as of the last recomputation
    score: f64,
}

impl StatusReporter {
    pub fn new(settings: ReporterSettings) -> Self {
        Self {
            settings,
            timings: TimingAggregator::new(),
            status_counts: BTreeMap::new(),
            recent_errors: VecDeque::new(),
            log: None,
            start_time: Instant::now(),
            last_score: 0.0,
            scored_at: None,
        }
    }

    pub fn spawn(self, rx: mpsc::Receiver<Report>) -> JoinHandle<ReportSummary> {
        tokio::spawn(self.run(rx))
    }

    /// Drain `rx` until every sender is gone. A status log that cannot be
    /// opened is skipped with a warning.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Report>) -> ReportSummary {
        if let Some(path) = self.settings.status_log.clone() {
            match OpenOptions::new().create(true).append(true).open(&path).await {
                Ok(file) => self.log = Some(BufWriter::new(file)),
                Err(e) => warn!("status log {} disabled: {e}", path.display()),
            }
        }

        let mut ticker = tokio::time::interval(self.settings.print_every.max(Duration::from_millis(1)));
        ticker.tick().await;

        loop {
            // work already queued goes first
            while let Ok(report) = rx.try_recv() {
                self.handle(report).await;
            }

            tokio::select! {
                biased;
                next = rx.recv() => match next {
                    Some(report) => self.handle(report).await,
                    None => break,
                },
                _ = ticker.tick() => self.print_progress(),
            }
        }

        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.flush().await {
                warn!("failed to flush status log: {e}");
            }
        }

        self.timings.calc_results();
        let summary = ReportSummary {
            score: self.timings.score(),
            timings: self.timings,
            status_counts: self.status_counts,
            recent_errors: self.recent_errors.into_iter().collect(),
            duration_ms: self.start_time.elapsed().as_millis() as u64,
        };
        info!(
            hits = summary.timings.total_hits(),
            errors = summary.timings.total_errors(),
            score = summary.score,
            "status intake closed"
        );
        summary
    }

    async fn handle(&mut self, report: Report) {
        match report {
            Report::Timing(sample) => {
                self.timings
                    .add_sample(&sample.route, sample.duration_ms, sample.status);
            }
            Report::Status(status) => {
                *self.status_counts.entry(status.code).or_insert(0) += 1;
                if matches!(status.code, StatusCode::Error | StatusCode::Failed) {
                    self.remember_error(&status);
                }
                self.write_log(&status).await;
            }
        }
    }

    fn remember_error(&mut self, status: &UserStatus) {
        let line = format!(
            "entity {} {}: {}",
            status.entity_num,
            status.code,
            status.error.as_deref().unwrap_or(&status.details)
        );
        self.recent_errors.push_back(line);
        while self.recent_errors.len() > self.settings.keep_errors {
            self.recent_errors.pop_front();
        }
    }

    async fn write_log(&mut self, status: &UserStatus) {
        let Some(log) = self.log.as_mut() else {
            return;
        };
        let mut line = match serde_json::to_vec(status) {
            Ok(line) => line,
            Err(e) => {
                warn!("failed to encode status event: {e}");
                return;
            }
        };
        line.push(b'\n');
        if let Err(e) = log.write_all(&line).await {
            warn!("status log disabled after write error: {e}");
            self.log = None;
        }
    }

    fn progress(&mut self) -> Progress {
        // sorting every sample is the expensive part; keep it off the hot tick
        let stale = self
            .scored_at
            .map_or(true, |at| at.elapsed() >= self.settings.score_every);
        if stale {
            self.timings.calc_results();
            self.last_score = self.timings.score();
            self.scored_at = Some(Instant::now());
        }

        let elapsed_s = self.start_time.elapsed().as_secs();
        let hits = self.timings.total_hits();
        let count = |code: StatusCode| self.status_counts.get(&code).copied().unwrap_or(0);
        Progress {
            hits,
            errors: self.timings.total_errors(),
            rate: if elapsed_s > 0 { hits / elapsed_s } else { 0 },
            routes: self.timings.routes.len(),
            active: count(StatusCode::Active),
            failed: count(StatusCode::Failed),
            score: self.last_score,
        }
    }

    fn print_progress(&mut self) {
        let p = self.progress();
        info!(
            "Progress: hits={} errors={} rate={}/s routes={} active={} failed={} score={:.2}",
            p.hits, p.errors, p.rate, p.routes, p.active, p.failed, p.score
        );
    }
}

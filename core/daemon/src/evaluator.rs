//! Periodic timer evaluation.
//!
//! One task owns the loop. Each tick runs a full cycle (store scan on a
//! blocking worker, then broadcast) before the next tick is observed, so
//! cycles never overlap; ticks missed while a cycle runs are skipped.

use chrono::{DateTime, Utc};
use playtime_daemon_protocol::{ServerMessage, TimerStatus, TimerView};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{self, AlertEvent};
use crate::connections::ConnectionManager;
use crate::error::StoreResult;
use crate::store::TimerStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredEvent {
    pub timer_id: String,
    pub child_name: String,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub evaluated: usize,
    pub updated: usize,
    pub failed: usize,
    pub pruned: usize,
    pub alerts: Vec<AlertEvent>,
    pub expirations: Vec<ExpiredEvent>,
    /// Every timer still counting down after this cycle.
    pub snapshot: Vec<TimerView>,
}

impl CycleReport {
    /// Snapshot first, then discrete events. Clients reconcile by tier
    /// severity, so the order is a courtesy, not a contract.
    pub fn messages(&self) -> Vec<ServerMessage> {
        let mut messages = Vec::with_capacity(1 + self.alerts.len() + self.expirations.len());
        messages.push(ServerMessage::TimersUpdate {
            timers: self.snapshot.clone(),
        });
        messages.extend(self.alerts.iter().map(AlertEvent::to_message));
        messages.extend(self.expirations.iter().map(|event| ServerMessage::TimerExpired {
            timer_id: event.timer_id.clone(),
            child_name: event.child_name.clone(),
        }));
        messages
    }
}

/// Evaluates every countable timer once at `now`.
///
/// A failure to persist one timer is logged and skipped; only a failure to
/// list timers at all fails the cycle.
pub fn run_cycle(
    store: &dyn TimerStore,
    now: DateTime<Utc>,
    grace: chrono::Duration,
) -> StoreResult<CycleReport> {
    let timers = store.list_evaluable()?;
    let mut report = CycleReport {
        evaluated: timers.len(),
        ..CycleReport::default()
    };

    for mut timer in timers {
        let remaining = timer.remaining(now);
        let crossed = alert::classify(&timer, now);
        let tier = crossed.or(timer.last_alert_tier);
        let status = alert::next_status(timer.status, remaining, tier);

        if status != timer.status || tier != timer.last_alert_tier {
            match store.record_progress(&timer.id, timer.end_at, status, tier, now) {
                Ok(true) => {
                    report.updated += 1;
                    debug!(
                        timer_id = %timer.id,
                        from = ?timer.status,
                        to = ?status,
                        tier = ?tier,
                        "Timer progressed"
                    );
                    if let Some(crossed) = crossed {
                        report.alerts.push(alert::build_event(&timer, crossed, now));
                    }
                    if status == TimerStatus::Expired {
                        report.expirations.push(ExpiredEvent {
                            timer_id: timer.id.clone(),
                            child_name: timer.child_name.clone(),
                        });
                    }
                    timer.status = status;
                    timer.last_alert_tier = tier;
                }
                Ok(false) => {
                    debug!(timer_id = %timer.id, "Timer changed during evaluation; retrying next cycle");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(timer_id = %timer.id, error = %err, "Failed to update timer; skipping");
                }
            }
        }

        if timer.is_evaluable() {
            report.snapshot.push(timer.view(now));
        }
    }

    let Some(cutoff) = now.checked_sub_signed(grace) else {
        warn!("Grace period out of range; skipping prune");
        return Ok(report);
    };
    match store.prune_expired(cutoff) {
        Ok(pruned) => {
            if pruned > 0 {
                debug!(pruned, "Pruned expired timers past grace period");
            }
            report.pruned = pruned;
        }
        Err(err) => warn!(error = %err, "Failed to prune expired timers"),
    }

    Ok(report)
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct EvaluatorSnapshot {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub alerts_emitted: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Default)]
pub struct EvaluatorStats {
    cycles: AtomicU64,
    failed_cycles: AtomicU64,
    alerts_emitted: AtomicU64,
    last: Mutex<(Option<DateTime<Utc>>, Option<String>)>,
}

impl EvaluatorStats {
    fn record_success(&self, at: DateTime<Utc>, alerts: usize) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.alerts_emitted.fetch_add(alerts as u64, Ordering::Relaxed);
        if let Ok(mut last) = self.last.lock() {
            last.0 = Some(at);
        }
    }

    fn record_failure(&self, at: DateTime<Utc>, message: String) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.failed_cycles.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last.lock() {
            *last = (Some(at), Some(message));
        }
    }

    pub fn snapshot(&self) -> EvaluatorSnapshot {
        let (last_cycle_at, last_error) = self
            .last
            .lock()
            .map(|last| last.clone())
            .unwrap_or_default();
        EvaluatorSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
            alerts_emitted: self.alerts_emitted.load(Ordering::Relaxed),
            last_cycle_at,
            last_error,
        }
    }
}

pub struct TimerEvaluator {
    store: Arc<dyn TimerStore>,
    connections: Arc<ConnectionManager>,
    stats: Arc<EvaluatorStats>,
    interval: Duration,
    grace: chrono::Duration,
}

impl TimerEvaluator {
    pub fn new(
        store: Arc<dyn TimerStore>,
        connections: Arc<ConnectionManager>,
        stats: Arc<EvaluatorStats>,
        interval: Duration,
        grace: chrono::Duration,
    ) -> Self {
        Self {
            store,
            connections,
            stats,
            interval,
            grace,
        }
    }

    /// Runs until `cancel` fires. A cycle already in flight finishes first.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_ms = self.interval.as_millis() as u64, "Timer evaluator started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }

        info!("Timer evaluator stopped");
    }

    /// One full cycle: evaluate, then publish. Returns the report when the
    /// cycle could read the store.
    pub async fn tick(&self) -> Option<CycleReport> {
        let store = Arc::clone(&self.store);
        let grace = self.grace;
        let now = Utc::now();

        let result = tokio::task::spawn_blocking(move || run_cycle(store.as_ref(), now, grace)).await;
        let report = match result {
            Ok(Ok(report)) => report,
            Ok(Err(err)) => {
                warn!(error = %err, "Timer evaluation cycle failed; retrying next tick");
                self.stats.record_failure(now, err.to_string());
                return None;
            }
            Err(err) => {
                error!(error = %err, "Timer evaluation cycle panicked");
                self.stats.record_failure(now, format!("cycle panicked: {}", err));
                return None;
            }
        };

        if report.failed > 0 || !report.alerts.is_empty() || !report.expirations.is_empty() {
            info!(
                evaluated = report.evaluated,
                updated = report.updated,
                failed = report.failed,
                alerts = report.alerts.len(),
                expired = report.expirations.len(),
                "Timer evaluation cycle"
            );
        }

        for message in report.messages() {
            self.connections.broadcast(&message).await;
        }
        self.stats.record_success(now, report.alerts.len());
        Some(report)
    }
}

mod booking;
mod capacity;
mod error;
mod queries;
mod status;
#[cfg(test)]
mod tests;

pub use capacity::{Segment, capacity_profile, check_admission, find_overlap, remaining_capacity};
pub use error::EngineError;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::calendar::{AvailabilityCalendar, AvailabilitySource};
use crate::clock::{Clock, SystemClock};
use crate::compactor;
use crate::config::Config;
use crate::guard::ConcurrencyGuard;
use crate::model::*;
use crate::notify::Notifier;
use crate::repository::{InMemoryRepository, Repository, WalRepository};

/// Admission, transitions and queries for appointments.
///
/// Cheap to clone: all state sits behind one `Arc`, so a clone can be moved
/// into a provider's critical section. Must be built inside a Tokio runtime.
#[derive(Clone)]
pub struct SchedulingEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    calendar: Arc<dyn AvailabilitySource>,
    repository: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    guard: Arc<ConcurrencyGuard>,
    events: mpsc::UnboundedSender<SchedulingEvent>,
    lock_wait: Option<Duration>,
    max_conflict_retries: u32,
    /// Maintenance tasks owned by this engine; aborted on drop.
    background: Vec<JoinHandle<()>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}

impl SchedulingEngine {
    pub fn new(
        calendar: Arc<dyn AvailabilitySource>,
        repository: Arc<dyn Repository>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::with_parts(calendar, repository, notifier, Arc::new(SystemClock), &Config::default())
    }

    pub fn with_parts(
        calendar: Arc<dyn AvailabilitySource>,
        repository: Arc<dyn Repository>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        Self::assemble(
            calendar,
            repository,
            notifier,
            clock,
            config,
            Arc::new(ConcurrencyGuard::new()),
            Vec::new(),
        )
    }

    /// Wire an engine from `config`: WAL-backed repository (plus its
    /// compactor) when a data dir is set, in-memory otherwise. Also starts
    /// the metrics exporter when a port is configured. Background tasks stop
    /// when the last clone of the engine is dropped.
    pub fn from_config(config: &Config, notifier: Arc<dyn Notifier>) -> io::Result<Self> {
        if let Err(e) = crate::observability::init(config.metrics_port) {
            warn!("metrics exporter not started: {e}");
        }

        let calendar = Arc::new(AvailabilityCalendar::new(config.slot_overlap));
        let guard = Arc::new(ConcurrencyGuard::new());
        let mut background = vec![tokio::spawn(compactor::run_lock_pruner(guard.clone()))];
        let repository: Arc<dyn Repository> = match &config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let wal = Arc::new(WalRepository::open(dir.join("appointments.wal"))?);
                background.push(tokio::spawn(compactor::run_compactor(
                    wal.clone(),
                    config.compact_threshold,
                )));
                info!(data_dir = %dir.display(), "using WAL repository");
                wal
            }
            None => {
                info!("using in-memory repository");
                Arc::new(InMemoryRepository::new())
            }
        };
        Ok(Self::assemble(
            calendar,
            repository,
            notifier,
            Arc::new(SystemClock),
            config,
            guard,
            background,
        ))
    }

    fn assemble(
        calendar: Arc<dyn AvailabilitySource>,
        repository: Arc<dyn Repository>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: &Config,
        guard: Arc<ConcurrencyGuard>,
        background: Vec<JoinHandle<()>>,
    ) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        // Drains until every sender is gone, so queued events still go out
        // after the engine is dropped.
        tokio::spawn(deliver_events(notifier, rx));
        Self {
            inner: Arc::new(EngineInner {
                calendar,
                repository,
                clock,
                guard,
                events,
                lock_wait: config.lock_wait,
                max_conflict_retries: config.max_conflict_retries,
                background,
            }),
        }
    }

    pub(super) fn now(&self) -> Ms {
        self.inner.clock.now_ms()
    }

    pub fn calendar(&self) -> &Arc<dyn AvailabilitySource> {
        &self.inner.calendar
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.inner.repository
    }

    /// Drop lock entries for providers nobody is currently using.
    pub fn prune_idle_locks(&self) -> usize {
        self.inner.guard.prune_idle()
    }

    /// Publish a provider's availability for `period`, serialized with that
    /// provider's admissions.
    pub async fn publish_availability(
        &self,
        provider_id: &str,
        period: Interval,
        slots: Vec<AvailabilitySlot>,
    ) -> Result<PublishOutcome, EngineError> {
        validate_id(provider_id)?;
        let calendar = self.inner.calendar.clone();
        let pid = provider_id.to_string();
        let result = self
            .inner
            .guard
            .with_provider_lock(provider_id, self.inner.lock_wait, async move {
                calendar.publish(&pid, &period, slots).await
            })
            .await;

        metrics::counter!(
            crate::observability::PUBLISHES_TOTAL,
            "outcome" => crate::observability::outcome_label(&result)
        )
        .increment(1);
        if let Ok(out) = &result {
            info!(provider_id, removed = out.removed, inserted = out.inserted, "availability published");
        }
        result
    }

    /// Fire-and-forget, after the lock is gone. Events reach the notifier
    /// one at a time, in dispatch order.
    pub(super) fn dispatch(&self, event: SchedulingEvent) {
        if self.inner.events.send(event).is_err() {
            warn!("notification queue closed, event dropped");
        }
    }
}

async fn deliver_events(notifier: Arc<dyn Notifier>, mut rx: mpsc::UnboundedReceiver<SchedulingEvent>) {
    while let Some(event) = rx.recv().await {
        notifier.notify(event).await;
    }
}

pub(crate) fn validate_id(id: &str) -> Result<(), EngineError> {
    if id.len() > crate::limits::MAX_ID_LEN {
        return Err(EngineError::LimitExceeded("identifier too long"));
    }
    Ok(())
}

pub(crate) fn validate_interval(interval: &Interval, max_duration: Ms) -> Result<(), EngineError> {
    use crate::limits::*;
    interval.validate()?;
    if interval.start < MIN_VALID_TIMESTAMP_MS || interval.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if interval.duration_ms() > max_duration {
        return Err(EngineError::LimitExceeded("interval too wide"));
    }
    Ok(())
}

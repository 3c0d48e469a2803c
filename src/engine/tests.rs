use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ulid::Ulid;

use super::*;
use crate::clock::ManualClock;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::repository::RepositoryError;
use crate::SlotOverlapPolicy;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms
/// 2025-07-01T00:00:00Z
const DAY: Ms = 1_751_328_000_000;

fn at(offset: Ms) -> Ms {
    DAY + offset
}

fn iv(start: Ms, end: Ms) -> Interval {
    Interval::new(at(start), at(end)).unwrap()
}

fn request(patient: &str, provider: &str, start: Ms, end: Ms) -> BookingRequest {
    BookingRequest::new(patient, provider, iv(start, end))
}

struct Harness {
    engine: SchedulingEngine,
    clock: Arc<ManualClock>,
    hub: Arc<NotifyHub>,
}

fn harness() -> Harness {
    harness_with(Arc::new(InMemoryRepository::new()), Config::default())
}

fn harness_with(repository: Arc<dyn Repository>, config: Config) -> Harness {
    let clock = Arc::new(ManualClock::new(DAY));
    let hub = Arc::new(NotifyHub::new());
    let calendar = Arc::new(AvailabilityCalendar::new(config.slot_overlap));
    let engine = SchedulingEngine::with_parts(calendar, repository, hub.clone(), clock.clone(), &config);
    Harness { engine, clock, hub }
}

/// Publish `[start, end)` as a single slot for `provider` on the test day.
async fn publish(engine: &SchedulingEngine, provider: &str, start: Ms, end: Ms, capacity: u32) {
    engine
        .publish_availability(
            provider,
            iv(0, 24 * H),
            vec![AvailabilitySlot::with_capacity(provider, iv(start, end), capacity)],
        )
        .await
        .unwrap();
}

fn test_data_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join("slotguard_test_engine").join(name);
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// Repository wrapper that injects conflicts, failures and latency.
#[derive(Default)]
struct FlakyRepository {
    inner: InMemoryRepository,
    conflicts_left: AtomicU32,
    unavailable: bool,
    load_delay: Option<Duration>,
}

#[async_trait]
impl Repository for FlakyRepository {
    async fn load_active_appointments(
        &self,
        provider_id: &str,
        interval: &Interval,
    ) -> Result<Vec<Appointment>, RepositoryError> {
        if let Some(d) = self.load_delay {
            tokio::time::sleep(d).await;
        }
        self.inner.load_active_appointments(provider_id, interval).await
    }

    async fn save(&self, appointment: &Appointment) -> Result<(), RepositoryError> {
        if self.unavailable {
            return Err(RepositoryError::Unavailable("disk on fire".into()));
        }
        if self
            .conflicts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RepositoryError::Conflict(appointment.appointment_id));
        }
        self.inner.save(appointment).await
    }

    async fn load_appointment(&self, appointment_id: Ulid) -> Result<Option<Appointment>, RepositoryError> {
        self.inner.load_appointment(appointment_id).await
    }

    async fn appointments_for_patient(&self, patient_id: &str) -> Result<Vec<Appointment>, RepositoryError> {
        self.inner.appointments_for_patient(patient_id).await
    }

    async fn appointments_for_provider(
        &self,
        provider_id: &str,
        window: &Interval,
    ) -> Result<Vec<Appointment>, RepositoryError> {
        self.inner.appointments_for_provider(provider_id, window).await
    }
}

// ── Admission ────────────────────────────────────────────

#[tokio::test]
async fn engine_doc_123_scenario() {
    let Harness { engine, .. } = harness();
    publish(&engine, "doc-123", 9 * H, 9 * H + 30 * M, 1).await;

    let first = engine
        .request_booking(request("p1", "doc-123", 9 * H, 9 * H + 30 * M))
        .await
        .unwrap();
    assert_eq!(first.status, AppointmentStatus::Pending);
    assert_eq!(first.patient_id, "p1");
    assert_eq!(first.version, 1);

    let overlapping = engine
        .request_booking(request("p2", "doc-123", 9 * H + 15 * M, 9 * H + 45 * M))
        .await;
    assert!(matches!(overlapping, Err(EngineError::SlotFull)));

    let adjacent = engine
        .request_booking(request("p3", "doc-123", 9 * H + 30 * M, 10 * H))
        .await;
    assert!(matches!(adjacent, Err(EngineError::NoAvailability)));
}

#[tokio::test]
async fn engine_shared_boundary_is_not_overlap() {
    let Harness { engine, .. } = harness();
    engine
        .publish_availability(
            "doc-1",
            iv(0, 24 * H),
            vec![
                AvailabilitySlot::new("doc-1", iv(9 * H, 9 * H + 30 * M)),
                AvailabilitySlot::new("doc-1", iv(9 * H + 30 * M, 10 * H)),
            ],
        )
        .await
        .unwrap();

    engine
        .request_booking(request("p1", "doc-1", 9 * H, 9 * H + 30 * M))
        .await
        .unwrap();
    engine
        .request_booking(request("p2", "doc-1", 9 * H + 30 * M, 10 * H))
        .await
        .unwrap();
}

#[tokio::test]
async fn engine_no_slots_published() {
    let Harness { engine, .. } = harness();
    let res = engine.request_booking(request("p1", "doc-1", 9 * H, 10 * H)).await;
    assert!(matches!(res, Err(EngineError::NoAvailability)));
}

#[tokio::test]
async fn engine_capacity_two_admits_two() {
    let Harness { engine, .. } = harness();
    publish(&engine, "doc-1", 9 * H, 10 * H, 2).await;

    for patient in ["p1", "p2"] {
        engine
            .request_booking(request(patient, "doc-1", 9 * H, 10 * H))
            .await
            .unwrap();
    }
    let third = engine.request_booking(request("p3", "doc-1", 9 * H, 10 * H)).await;
    assert!(matches!(third, Err(EngineError::SlotFull)));
}

#[tokio::test]
async fn engine_request_wider_than_slot() {
    let Harness { engine, .. } = harness();
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;
    let res = engine.request_booking(request("p1", "doc-1", 9 * H, 11 * H)).await;
    assert!(matches!(res, Err(EngineError::NoAvailability)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn engine_concurrent_requests_single_winner() {
    let Harness { engine, .. } = harness();
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;

    let n = 64;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.request_booking(request(&format!("p{i}"), "doc-1", 9 * H, 10 * H))
                .await
        }));
    }

    let mut admitted = 0;
    let mut full = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(EngineError::SlotFull) => full += 1,
            Err(e) => panic!("unexpected rejection: {e}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(full, n - 1);

    let active = engine
        .repository()
        .load_active_appointments("doc-1", &iv(0, 24 * H))
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn engine_concurrent_requests_respect_capacity() {
    let Harness { engine, .. } = harness();
    publish(&engine, "doc-1", 9 * H, 10 * H, 5).await;

    let mut handles = Vec::new();
    for i in 0..40 {
        let eng = engine.clone();
        // Staggered, partially overlapping requests.
        let start = 9 * H + (i % 4) * 15 * M;
        handles.push(tokio::spawn(async move {
            eng.request_booking(request(&format!("p{i}"), "doc-1", start, start + 15 * M))
                .await
        }));
    }
    for h in handles {
        let _ = h.await.unwrap();
    }

    let active = engine
        .repository()
        .load_active_appointments("doc-1", &iv(0, 24 * H))
        .await
        .unwrap();
    let intervals: Vec<Interval> = active.iter().map(|a| a.interval).collect();
    let slots = vec![AvailabilitySlot::with_capacity("doc-1", iv(9 * H, 10 * H), 5)];
    for seg in capacity_profile(&slots, &intervals, &iv(9 * H, 10 * H)) {
        assert!(seg.occupied <= seg.capacity, "overbooked segment: {seg:?}");
    }
    assert_eq!(active.len(), 20);
}

#[tokio::test]
async fn engine_cancel_frees_capacity() {
    let Harness { engine, .. } = harness();
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;

    let appt = engine
        .request_booking(request("p1", "doc-1", 9 * H, 10 * H))
        .await
        .unwrap();
    assert_eq!(engine.remaining_capacity("doc-1", iv(9 * H, 10 * H)).await.unwrap(), 0);

    let cancelled = engine.cancel_booking(appt.appointment_id, Actor::Patient).await.unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
    assert_eq!(cancelled.cancelled_by, Some(Actor::Patient));
    assert_eq!(engine.remaining_capacity("doc-1", iv(9 * H, 10 * H)).await.unwrap(), 1);

    engine
        .request_booking(request("p2", "doc-1", 9 * H, 10 * H))
        .await
        .unwrap();
}

// ── Transitions ──────────────────────────────────────────

#[tokio::test]
async fn engine_cancel_twice_is_illegal() {
    let Harness { engine, .. } = harness();
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;
    let appt = engine
        .request_booking(request("p1", "doc-1", 9 * H, 10 * H))
        .await
        .unwrap();

    let first = engine.cancel_booking(appt.appointment_id, Actor::Provider).await.unwrap();
    let second = engine.cancel_booking(appt.appointment_id, Actor::Patient).await;
    assert!(matches!(
        second,
        Err(EngineError::IllegalTransition {
            from: AppointmentStatus::Cancelled,
            to: AppointmentStatus::Cancelled
        })
    ));

    let stored = engine.get_appointment(appt.appointment_id).await.unwrap();
    assert_eq!(stored, first);
    assert_eq!(stored.cancelled_by, Some(Actor::Provider));
}

#[tokio::test]
async fn engine_complete_is_time_gated() {
    let Harness { engine, clock, .. } = harness();
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;
    let appt = engine
        .request_booking(request("p1", "doc-1", 9 * H, 10 * H))
        .await
        .unwrap();
    engine.confirm_booking(appt.appointment_id).await.unwrap();

    clock.set(at(9 * H + 45 * M));
    let early = engine
        .update_status(appt.appointment_id, AppointmentStatus::Completed)
        .await;
    assert!(matches!(
        early,
        Err(EngineError::TimeConstraintViolated { ends_at, .. }) if ends_at == at(10 * H)
    ));
    let unchanged = engine.get_appointment(appt.appointment_id).await.unwrap();
    assert_eq!(unchanged.status, AppointmentStatus::Confirmed);

    clock.set(at(10 * H));
    let done = engine
        .update_status(appt.appointment_id, AppointmentStatus::Completed)
        .await
        .unwrap();
    assert_eq!(done.status, AppointmentStatus::Completed);
    assert_eq!(done.version, 3);
    assert_eq!(done.updated_at, at(10 * H));

    let cancel_after = engine.cancel_booking(appt.appointment_id, Actor::Patient).await;
    assert!(matches!(cancel_after, Err(EngineError::IllegalTransition { .. })));
}

#[tokio::test]
async fn engine_no_show_requires_confirmation() {
    let Harness { engine, clock, .. } = harness();
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;
    let appt = engine
        .request_booking(request("p1", "doc-1", 9 * H, 10 * H))
        .await
        .unwrap();

    clock.set(at(11 * H));
    let res = engine.update_status(appt.appointment_id, AppointmentStatus::NoShow).await;
    assert!(matches!(
        res,
        Err(EngineError::IllegalTransition {
            from: AppointmentStatus::Pending,
            to: AppointmentStatus::NoShow
        })
    ));

    engine.confirm_booking(appt.appointment_id).await.unwrap();
    let no_show = engine
        .update_status(appt.appointment_id, AppointmentStatus::NoShow)
        .await
        .unwrap();
    assert_eq!(no_show.status, AppointmentStatus::NoShow);
}

#[tokio::test]
async fn engine_update_status_edge_cases() {
    let Harness { engine, .. } = harness();
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;
    let appt = engine
        .request_booking(request("p1", "doc-1", 9 * H, 10 * H))
        .await
        .unwrap();

    let back_to_pending = engine
        .update_status(appt.appointment_id, AppointmentStatus::Pending)
        .await;
    assert!(matches!(
        back_to_pending,
        Err(EngineError::IllegalTransition {
            from: AppointmentStatus::Pending,
            to: AppointmentStatus::Pending
        })
    ));

    let cancelled = engine
        .update_status(appt.appointment_id, AppointmentStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(cancelled.cancelled_by, Some(Actor::System));

    let missing = Ulid::new();
    let res = engine.update_status(missing, AppointmentStatus::Confirmed).await;
    assert!(matches!(res, Err(EngineError::NotFound(id)) if id == missing));
    let res = engine.cancel_booking(missing, Actor::Patient).await;
    assert!(matches!(res, Err(EngineError::NotFound(_))));
}

// ── Repository interplay ─────────────────────────────────

#[tokio::test]
async fn engine_conflict_is_retried() {
    let repo = Arc::new(FlakyRepository::default());
    repo.conflicts_left.store(2, Ordering::SeqCst);
    let Harness { engine, .. } = harness_with(repo.clone(), Config::default());
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;

    let appt = engine
        .request_booking(request("p1", "doc-1", 9 * H, 10 * H))
        .await
        .unwrap();
    assert_eq!(repo.conflicts_left.load(Ordering::SeqCst), 0);
    assert!(repo.inner.get(&appt.appointment_id).is_some());
}

#[tokio::test]
async fn engine_conflict_retries_exhausted_is_slot_full() {
    let repo = Arc::new(FlakyRepository::default());
    repo.conflicts_left.store(10, Ordering::SeqCst);
    let config = Config {
        max_conflict_retries: 2,
        ..Config::default()
    };
    let Harness { engine, .. } = harness_with(repo.clone(), config);
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;

    let res = engine.request_booking(request("p1", "doc-1", 9 * H, 10 * H)).await;
    assert!(matches!(res, Err(EngineError::SlotFull)));
    // One attempt plus two retries.
    assert_eq!(repo.conflicts_left.load(Ordering::SeqCst), 7);
    assert!(repo.inner.is_empty());
}

#[tokio::test]
async fn engine_storage_failure_is_not_a_rejection() {
    let repo = Arc::new(FlakyRepository {
        unavailable: true,
        ..FlakyRepository::default()
    });
    let Harness { engine, .. } = harness_with(repo, Config::default());
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;

    let err = engine
        .request_booking(request("p1", "doc-1", 9 * H, 10 * H))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Storage(_)));
    assert!(!err.is_rejection());
    assert!(EngineError::SlotFull.is_rejection());
}

#[tokio::test]
async fn engine_lock_wait_times_out() {
    let repo = Arc::new(FlakyRepository {
        load_delay: Some(Duration::from_millis(200)),
        ..FlakyRepository::default()
    });
    let config = Config {
        lock_wait: Some(Duration::from_millis(20)),
        ..Config::default()
    };
    let Harness { engine, .. } = harness_with(repo, config);
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;

    let eng = engine.clone();
    let slow = tokio::spawn(async move {
        eng.request_booking(request("p1", "doc-1", 9 * H, 10 * H)).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let res = engine.request_booking(request("p2", "doc-1", 9 * H, 10 * H)).await;
    assert!(matches!(res, Err(EngineError::LockTimeout)));
    assert!(slow.await.unwrap().is_ok());
}

#[tokio::test]
async fn engine_wal_repository_survives_restart() {
    let dir = test_data_dir("restart");
    let config = Config {
        data_dir: Some(dir.clone()),
        ..Config::default()
    };

    let appt_id = {
        let engine = SchedulingEngine::from_config(&config, Arc::new(NotifyHub::new())).unwrap();
        publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;
        let appt = engine
            .request_booking(request("p1", "doc-1", 9 * H, 10 * H))
            .await
            .unwrap();
        engine.confirm_booking(appt.appointment_id).await.unwrap();
        appt.appointment_id
    };

    let engine = SchedulingEngine::from_config(&config, Arc::new(NotifyHub::new())).unwrap();
    let reloaded = engine.get_appointment(appt_id).await.unwrap();
    assert_eq!(reloaded.status, AppointmentStatus::Confirmed);
    assert_eq!(reloaded.interval, iv(9 * H, 10 * H));

    // Availability is not persisted; the reloaded appointment still counts once republished.
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;
    let res = engine.request_booking(request("p2", "doc-1", 9 * H, 10 * H)).await;
    assert!(matches!(res, Err(EngineError::SlotFull)));
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn engine_drop_stops_background_tasks() {
    let dir = test_data_dir("drop");
    let config = Config {
        data_dir: Some(dir.clone()),
        ..Config::default()
    };
    let engine = SchedulingEngine::from_config(&config, Arc::new(NotifyHub::new())).unwrap();
    let repository = Arc::downgrade(engine.repository());
    tokio::task::yield_now().await;
    assert!(repository.upgrade().is_some());

    drop(engine);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while repository.upgrade().is_some() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(repository.upgrade().is_none(), "compactor still holds the WAL repository");
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn engine_from_config_installs_metrics_exporter() {
    let config = Config {
        metrics_port: Some(0),
        ..Config::default()
    };
    SchedulingEngine::from_config(&config, Arc::new(NotifyHub::new())).unwrap();
    // The global recorder is taken now. A second engine still starts.
    assert!(crate::observability::init(Some(0)).is_err());
    SchedulingEngine::from_config(&config, Arc::new(NotifyHub::new())).unwrap();
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn engine_emits_events_after_commit() {
    let Harness { engine, hub, .. } = harness();
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;
    let mut rx = hub.subscribe("doc-1");

    let appt = engine
        .request_booking(request("p1", "doc-1", 9 * H, 10 * H))
        .await
        .unwrap();
    let created = rx.recv().await.unwrap();
    assert_eq!(created.kind, EventKind::BookingCreated);
    assert_eq!(created.appointment, appt);

    engine.confirm_booking(appt.appointment_id).await.unwrap();
    let changed = rx.recv().await.unwrap();
    assert_eq!(
        changed.kind,
        EventKind::StatusChanged {
            from: AppointmentStatus::Pending,
            to: AppointmentStatus::Confirmed
        }
    );

    // Rejections emit nothing.
    let _ = engine.request_booking(request("p2", "doc-1", 9 * H, 10 * H)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(rx.try_recv().is_err());
}

/// Records event kinds; creation events are slowed down so a reordering
/// notifier pipeline would show up.
#[derive(Default)]
struct RecordingNotifier {
    seen: std::sync::Mutex<Vec<EventKind>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: SchedulingEvent) {
        if event.kind == EventKind::BookingCreated {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.seen.lock().unwrap().push(event.kind);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn engine_events_delivered_in_order() {
    let clock = Arc::new(ManualClock::new(DAY));
    let recorder = Arc::new(RecordingNotifier::default());
    let engine = SchedulingEngine::with_parts(
        Arc::new(AvailabilityCalendar::default()),
        Arc::new(InMemoryRepository::new()),
        recorder.clone(),
        clock.clone(),
        &Config::default(),
    );
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;

    let appt = engine
        .request_booking(request("p1", "doc-1", 9 * H, 10 * H))
        .await
        .unwrap();
    engine.confirm_booking(appt.appointment_id).await.unwrap();
    clock.set(at(10 * H));
    engine
        .update_status(appt.appointment_id, AppointmentStatus::Completed)
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while recorder.seen.lock().unwrap().len() < 3 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        *recorder.seen.lock().unwrap(),
        vec![
            EventKind::BookingCreated,
            EventKind::StatusChanged {
                from: AppointmentStatus::Pending,
                to: AppointmentStatus::Confirmed
            },
            EventKind::StatusChanged {
                from: AppointmentStatus::Confirmed,
                to: AppointmentStatus::Completed
            },
        ]
    );
}

// ── Publishing & queries ─────────────────────────────────

#[tokio::test]
async fn engine_republish_keeps_appointments() {
    let Harness { engine, .. } = harness();
    publish(&engine, "doc-1", 9 * H, 10 * H, 2).await;
    let appt = engine
        .request_booking(request("p1", "doc-1", 9 * H, 10 * H))
        .await
        .unwrap();

    // Drop capacity to 1: the existing booking stays, the slot is now full.
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;
    assert_eq!(engine.get_appointment(appt.appointment_id).await.unwrap().status, AppointmentStatus::Pending);
    let res = engine.request_booking(request("p2", "doc-1", 9 * H, 10 * H)).await;
    assert!(matches!(res, Err(EngineError::SlotFull)));

    // Remove availability entirely.
    let out = engine
        .publish_availability("doc-1", iv(0, 24 * H), vec![])
        .await
        .unwrap();
    assert_eq!(out, PublishOutcome { removed: 1, inserted: 0 });
    let res = engine.request_booking(request("p2", "doc-1", 9 * H, 10 * H)).await;
    assert!(matches!(res, Err(EngineError::NoAvailability)));
}

#[tokio::test]
async fn engine_stacked_slots() {
    let config = Config {
        slot_overlap: SlotOverlapPolicy::Stack,
        ..Config::default()
    };
    let Harness { engine, .. } = harness_with(Arc::new(InMemoryRepository::new()), config);
    engine
        .publish_availability(
            "doc-1",
            iv(0, 24 * H),
            vec![
                AvailabilitySlot::new("doc-1", iv(9 * H, 10 * H)),
                AvailabilitySlot::new("doc-1", iv(9 * H, 10 * H)),
            ],
        )
        .await
        .unwrap();

    for patient in ["p1", "p2"] {
        engine
            .request_booking(request(patient, "doc-1", 9 * H, 10 * H))
            .await
            .unwrap();
    }
    let res = engine.request_booking(request("p3", "doc-1", 9 * H, 10 * H)).await;
    assert!(matches!(res, Err(EngineError::SlotFull)));
}

#[tokio::test]
async fn engine_available_slots_omits_full() {
    let Harness { engine, .. } = harness();
    engine
        .publish_availability(
            "doc-1",
            iv(0, 24 * H),
            vec![
                AvailabilitySlot::new("doc-1", iv(9 * H, 10 * H)),
                AvailabilitySlot::with_capacity("doc-1", iv(10 * H, 11 * H), 3),
                AvailabilitySlot::new("doc-1", iv(14 * H, 15 * H)),
            ],
        )
        .await
        .unwrap();
    engine
        .request_booking(request("p1", "doc-1", 9 * H, 10 * H))
        .await
        .unwrap();
    engine
        .request_booking(request("p2", "doc-1", 10 * H, 11 * H))
        .await
        .unwrap();

    let open = engine.available_slots("doc-1", iv(8 * H, 12 * H)).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].slot.interval, iv(10 * H, 11 * H));
    assert_eq!(open[0].free, iv(10 * H, 11 * H));
    assert_eq!(open[0].remaining, 2);

    assert!(engine.available_slots("doc-9", iv(8 * H, 12 * H)).await.unwrap().is_empty());
}

#[tokio::test]
async fn engine_patient_and_provider_listings() {
    let Harness { engine, .. } = harness();
    publish(&engine, "doc-1", 9 * H, 12 * H, 1).await;
    publish(&engine, "doc-2", 9 * H, 12 * H, 1).await;

    let a = engine
        .request_booking(request("p1", "doc-1", 11 * H, 12 * H).with_type(AppointmentType::FollowUp))
        .await
        .unwrap();
    let b = engine
        .request_booking(request("p1", "doc-2", 9 * H, 10 * H).with_reason("headache"))
        .await
        .unwrap();
    engine
        .request_booking(request("p2", "doc-1", 9 * H, 10 * H))
        .await
        .unwrap();
    engine.cancel_booking(a.appointment_id, Actor::Patient).await.unwrap();

    let mine = engine.appointments_for_patient("p1").await.unwrap();
    let ids: Vec<Ulid> = mine.iter().map(|x| x.appointment_id).collect();
    assert_eq!(ids, vec![b.appointment_id, a.appointment_id]);
    assert_eq!(mine[0].reason.as_deref(), Some("headache"));
    assert_eq!(mine[1].appointment_type, AppointmentType::FollowUp);
    assert_eq!(mine[1].status, AppointmentStatus::Cancelled);

    let doc1 = engine.appointments_for_provider("doc-1", iv(0, 24 * H)).await.unwrap();
    assert_eq!(doc1.len(), 2);
    let morning = engine.appointments_for_provider("doc-1", iv(9 * H, 10 * H)).await.unwrap();
    assert_eq!(morning.len(), 1);
}

#[tokio::test]
async fn engine_available_slots_reports_free_stretches() {
    let Harness { engine, .. } = harness();
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;
    engine
        .request_booking(request("p1", "doc-1", 9 * H, 9 * H + 30 * M))
        .await
        .unwrap();

    let open = engine.available_slots("doc-1", iv(8 * H, 12 * H)).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].slot.interval, iv(9 * H, 10 * H));
    assert_eq!(open[0].free, iv(9 * H + 30 * M, 10 * H));
    assert_eq!(open[0].remaining, 1);

    // What is reported as free can actually be booked.
    engine
        .request_booking(request("p2", "doc-1", 9 * H + 30 * M, 10 * H))
        .await
        .unwrap();
    assert!(engine.available_slots("doc-1", iv(8 * H, 12 * H)).await.unwrap().is_empty());
}

// ── Rescheduling ─────────────────────────────────────────

#[tokio::test]
async fn engine_reschedule_into_free_slot() {
    let Harness { engine, hub, .. } = harness();
    engine
        .publish_availability(
            "doc-1",
            iv(0, 24 * H),
            vec![
                AvailabilitySlot::new("doc-1", iv(9 * H, 10 * H)),
                AvailabilitySlot::new("doc-1", iv(14 * H, 15 * H)),
            ],
        )
        .await
        .unwrap();
    let mut rx = hub.subscribe("doc-1");
    let appt = engine
        .request_booking(request("p1", "doc-1", 9 * H, 10 * H))
        .await
        .unwrap();
    engine.confirm_booking(appt.appointment_id).await.unwrap();

    let moved = engine
        .reschedule_booking(appt.appointment_id, iv(14 * H, 15 * H))
        .await
        .unwrap();
    assert_eq!(moved.appointment_id, appt.appointment_id);
    assert_eq!(moved.interval, iv(14 * H, 15 * H));
    assert_eq!(moved.status, AppointmentStatus::Confirmed);
    assert_eq!(moved.version, 3);
    assert_eq!(engine.get_appointment(appt.appointment_id).await.unwrap(), moved);

    assert_eq!(rx.recv().await.unwrap().kind, EventKind::BookingCreated);
    assert!(matches!(rx.recv().await.unwrap().kind, EventKind::StatusChanged { .. }));
    let ev = rx.recv().await.unwrap();
    assert_eq!(ev.appointment, moved);
    assert_eq!(
        ev.kind,
        EventKind::Rescheduled {
            from: iv(9 * H, 10 * H),
            to: iv(14 * H, 15 * H)
        }
    );

    // The old slot is free again, the new one is taken.
    engine
        .request_booking(request("p2", "doc-1", 9 * H, 10 * H))
        .await
        .unwrap();
    let res = engine.request_booking(request("p3", "doc-1", 14 * H, 15 * H)).await;
    assert!(matches!(res, Err(EngineError::SlotFull)));
}

#[tokio::test]
async fn engine_reschedule_overlapping_own_interval() {
    let Harness { engine, .. } = harness();
    publish(&engine, "doc-1", 9 * H, 11 * H, 1).await;
    let appt = engine
        .request_booking(request("p1", "doc-1", 9 * H, 10 * H))
        .await
        .unwrap();

    // Capacity 1 and the only holder is the appointment being moved.
    let moved = engine
        .reschedule_booking(appt.appointment_id, iv(9 * H + 30 * M, 10 * H + 30 * M))
        .await
        .unwrap();
    assert_eq!(moved.interval, iv(9 * H + 30 * M, 10 * H + 30 * M));
    assert_eq!(engine.remaining_capacity("doc-1", iv(9 * H, 9 * H + 30 * M)).await.unwrap(), 1);
}

#[tokio::test]
async fn engine_reschedule_into_full_slot_leaves_appointment() {
    let Harness { engine, .. } = harness();
    engine
        .publish_availability(
            "doc-1",
            iv(0, 24 * H),
            vec![
                AvailabilitySlot::new("doc-1", iv(9 * H, 10 * H)),
                AvailabilitySlot::new("doc-1", iv(14 * H, 15 * H)),
            ],
        )
        .await
        .unwrap();
    let mine = engine
        .request_booking(request("p1", "doc-1", 9 * H, 10 * H))
        .await
        .unwrap();
    engine
        .request_booking(request("p2", "doc-1", 14 * H, 15 * H))
        .await
        .unwrap();

    let res = engine.reschedule_booking(mine.appointment_id, iv(14 * H, 15 * H)).await;
    assert!(matches!(res, Err(EngineError::SlotFull)));
    let res = engine.reschedule_booking(mine.appointment_id, iv(16 * H, 17 * H)).await;
    assert!(matches!(res, Err(EngineError::NoAvailability)));
    assert_eq!(engine.get_appointment(mine.appointment_id).await.unwrap(), mine);
}

#[tokio::test]
async fn engine_reschedule_rejects_terminal_and_unknown() {
    let Harness { engine, .. } = harness();
    publish(&engine, "doc-1", 9 * H, 15 * H, 1).await;
    let appt = engine
        .request_booking(request("p1", "doc-1", 9 * H, 10 * H))
        .await
        .unwrap();
    let cancelled = engine.cancel_booking(appt.appointment_id, Actor::Patient).await.unwrap();

    let res = engine.reschedule_booking(appt.appointment_id, iv(11 * H, 12 * H)).await;
    assert!(matches!(
        res,
        Err(EngineError::IllegalTransition {
            from: AppointmentStatus::Cancelled,
            ..
        })
    ));
    assert_eq!(engine.get_appointment(appt.appointment_id).await.unwrap(), cancelled);

    let res = engine.reschedule_booking(Ulid::new(), iv(11 * H, 12 * H)).await;
    assert!(matches!(res, Err(EngineError::NotFound(_))));

    let inverted = Interval {
        start: at(12 * H),
        end: at(11 * H),
    };
    let res = engine.reschedule_booking(appt.appointment_id, inverted).await;
    assert!(matches!(res, Err(EngineError::InvalidInterval { .. })));
}

// ── Limit tests ──────────────────────────────────────────

#[tokio::test]
async fn engine_rejects_degenerate_intervals() {
    let Harness { engine, .. } = harness();
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;

    let json = format!(r#"{{"start":{},"end":{}}}"#, at(9 * H + 40 * M), at(9 * H + 20 * M));
    assert!(serde_json::from_str::<Interval>(&json).is_err());

    let zero = Interval {
        start: at(9 * H + 30 * M),
        end: at(9 * H + 30 * M),
    };
    let inverted = Interval {
        start: at(9 * H + 40 * M),
        end: at(9 * H + 20 * M),
    };
    for interval in [zero, inverted] {
        let res = engine
            .request_booking(BookingRequest::new("p1", "doc-1", interval))
            .await;
        assert!(matches!(res, Err(EngineError::InvalidInterval { .. })), "{interval:?}: {res:?}");
        let res = engine.remaining_capacity("doc-1", interval).await;
        assert!(matches!(res, Err(EngineError::InvalidInterval { .. })));
    }
    assert!(
        engine
            .appointments_for_provider("doc-1", iv(0, 24 * H))
            .await
            .unwrap()
            .is_empty()
    );
}

// ── Limit tests ──────────────────────────────────────────

#[tokio::test]
async fn engine_request_limits() {
    let Harness { engine, .. } = harness();
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;

    let long_reason = "x".repeat(MAX_REASON_LEN + 1);
    let res = engine
        .request_booking(request("p1", "doc-1", 9 * H, 10 * H).with_reason(long_reason))
        .await;
    assert!(matches!(res, Err(EngineError::LimitExceeded("reason too long"))));

    let too_long = BookingRequest::new(
        "p1",
        "doc-1",
        Interval::new(at(0), at(MAX_APPOINTMENT_DURATION_MS + 1)).unwrap(),
    );
    let res = engine.request_booking(too_long).await;
    assert!(matches!(res, Err(EngineError::LimitExceeded("interval too wide"))));

    let ancient = BookingRequest::new("p1", "doc-1", Interval::new(0, H).unwrap());
    let res = engine.request_booking(ancient).await;
    assert!(matches!(res, Err(EngineError::LimitExceeded("timestamp out of range"))));

    let long_id = "d".repeat(MAX_ID_LEN + 1);
    let res = engine.request_booking(request("p1", &long_id, 9 * H, 10 * H)).await;
    assert!(matches!(res, Err(EngineError::LimitExceeded("identifier too long"))));
}

#[tokio::test]
async fn engine_idle_locks_pruned() {
    let Harness { engine, .. } = harness();
    publish(&engine, "doc-1", 9 * H, 10 * H, 1).await;
    publish(&engine, "doc-2", 9 * H, 10 * H, 1).await;
    assert_eq!(engine.prune_idle_locks(), 2);
    assert_eq!(engine.prune_idle_locks(), 0);
}

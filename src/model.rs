use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Unix milliseconds, UTC.
pub type Ms = i64;

/// Opaque provider (doctor) identifier.
pub type ProviderId = String;

/// Opaque patient identifier.
pub type PatientId = String;

/// Half-open interval `[start, end)`.
///
/// Deserialization goes through `Interval::new`. The fields stay public, so
/// anything built from a literal is re-checked with `validate` wherever it
/// enters the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawInterval")]
pub struct Interval {
    pub start: Ms,
    pub end: Ms,
}

#[derive(Deserialize)]
struct RawInterval {
    start: Ms,
    end: Ms,
}

impl TryFrom<RawInterval> for Interval {
    type Error = EngineError;

    fn try_from(raw: RawInterval) -> Result<Self, Self::Error> {
        Interval::new(raw.start, raw.end)
    }
}

impl Interval {
    /// Zero-length and inverted intervals are rejected.
    pub fn new(start: Ms, end: Ms) -> Result<Self, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        Self::new(self.start, self.end).map(|_| ())
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_interval(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersection(&self, other: &Interval) -> Option<Interval> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(Interval { start, end })
    }
}

/// A published, bookable range of a provider's time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub provider_id: ProviderId,
    pub interval: Interval,
    /// Max simultaneous active appointments (default 1).
    pub capacity: u32,
}

impl AvailabilitySlot {
    pub fn new(provider_id: impl Into<ProviderId>, interval: Interval) -> Self {
        Self::with_capacity(provider_id, interval, 1)
    }

    pub fn with_capacity(provider_id: impl Into<ProviderId>, interval: Interval, capacity: u32) -> Self {
        Self {
            provider_id: provider_id.into(),
            interval,
            capacity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl AppointmentStatus {
    /// Active appointments consume slot capacity.
    pub fn is_active(&self) -> bool {
        matches!(self, AppointmentStatus::Pending | AppointmentStatus::Confirmed)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::NoShow => "no_show",
        }
    }

    /// Target state of `transition` from `self`, or `None` if illegal.
    pub fn after(&self, transition: Transition) -> Option<AppointmentStatus> {
        use AppointmentStatus::*;
        match (self, transition) {
            (Pending, Transition::Confirm) => Some(Confirmed),
            (Pending | Confirmed, Transition::Cancel) => Some(Cancelled),
            (Confirmed, Transition::MarkCompleted) => Some(Completed),
            (Confirmed, Transition::MarkNoShow) => Some(NoShow),
            _ => None,
        }
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that move an appointment between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transition {
    Confirm,
    Cancel,
    MarkCompleted,
    MarkNoShow,
}

impl Transition {
    /// The transition that leads to `status`. `Pending` is only reachable by creation.
    pub fn leading_to(status: AppointmentStatus) -> Option<Transition> {
        match status {
            AppointmentStatus::Pending => None,
            AppointmentStatus::Confirmed => Some(Transition::Confirm),
            AppointmentStatus::Cancelled => Some(Transition::Cancel),
            AppointmentStatus::Completed => Some(Transition::MarkCompleted),
            AppointmentStatus::NoShow => Some(Transition::MarkNoShow),
        }
    }

    pub fn target(&self) -> AppointmentStatus {
        match self {
            Transition::Confirm => AppointmentStatus::Confirmed,
            Transition::Cancel => AppointmentStatus::Cancelled,
            Transition::MarkCompleted => AppointmentStatus::Completed,
            Transition::MarkNoShow => AppointmentStatus::NoShow,
        }
    }

    /// Completed/NoShow are only accepted once the appointment has ended.
    pub fn is_time_gated(&self) -> bool {
        matches!(self, Transition::MarkCompleted | Transition::MarkNoShow)
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Transition::Confirm => "confirm",
            Transition::Cancel => "cancel",
            Transition::MarkCompleted => "mark_completed",
            Transition::MarkNoShow => "mark_no_show",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentType {
    #[default]
    Consultation,
    FollowUp,
    Telemedicine,
    LabWork,
}

/// Who asked for a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Patient,
    Provider,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub appointment_id: Ulid,
    pub patient_id: PatientId,
    pub provider_id: ProviderId,
    pub interval: Interval,
    pub status: AppointmentStatus,
    pub appointment_type: AppointmentType,
    pub reason: Option<String>,
    pub cancelled_by: Option<Actor>,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Bumped on every persisted change; the repository rejects stale writes.
    pub version: u64,
}

impl Appointment {
    pub fn new_pending(request: &BookingRequest, now: Ms) -> Self {
        Self {
            appointment_id: Ulid::new(),
            patient_id: request.patient_id.clone(),
            provider_id: request.provider_id.clone(),
            interval: request.interval,
            status: AppointmentStatus::Pending,
            appointment_type: request.appointment_type,
            reason: request.reason.clone(),
            cancelled_by: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Compute the appointment after `transition` without touching `self`.
    pub fn transitioned(
        &self,
        transition: Transition,
        actor: Option<Actor>,
        now: Ms,
    ) -> Result<Appointment, EngineError> {
        let next = self
            .status
            .after(transition)
            .ok_or(EngineError::IllegalTransition {
                from: self.status,
                to: transition.target(),
            })?;
        if transition.is_time_gated() && now < self.interval.end {
            return Err(EngineError::TimeConstraintViolated {
                ends_at: self.interval.end,
                now,
            });
        }

        let mut updated = self.clone();
        updated.status = next;
        if transition == Transition::Cancel {
            updated.cancelled_by = Some(actor.unwrap_or(Actor::System));
        }
        updated.updated_at = now;
        updated.version += 1;
        Ok(updated)
    }

    /// Compute the appointment moved to `interval`. Only active appointments move.
    pub fn rescheduled(&self, interval: Interval, now: Ms) -> Result<Appointment, EngineError> {
        if !self.is_active() {
            return Err(EngineError::IllegalTransition {
                from: self.status,
                to: self.status,
            });
        }
        let mut updated = self.clone();
        updated.interval = interval;
        updated.updated_at = now;
        updated.version += 1;
        Ok(updated)
    }
}

/// Input to `SchedulingEngine::request_booking`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub patient_id: PatientId,
    pub provider_id: ProviderId,
    pub interval: Interval,
    pub reason: Option<String>,
    pub appointment_type: AppointmentType,
}

impl BookingRequest {
    pub fn new(patient_id: impl Into<PatientId>, provider_id: impl Into<ProviderId>, interval: Interval) -> Self {
        Self {
            patient_id: patient_id.into(),
            provider_id: provider_id.into(),
            interval,
            reason: None,
            appointment_type: AppointmentType::default(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_type(mut self, appointment_type: AppointmentType) -> Self {
        self.appointment_type = appointment_type;
        self
    }
}

// ── Notification events ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    BookingCreated,
    StatusChanged {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    Rescheduled {
        from: Interval,
        to: Interval,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingEvent {
    pub kind: EventKind,
    pub appointment: Appointment,
    pub at: Ms,
}

// ── Query result types ───────────────────────────────────────────

/// A bookable stretch of a published slot. `free` lies within
/// `slot.interval` and every instant of it has `remaining` headroom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSlot {
    pub slot: AvailabilitySlot,
    pub free: Interval,
    pub remaining: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOutcome {
    pub removed: usize,
    pub inserted: usize,
}

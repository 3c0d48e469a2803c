use std::time::Instant;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::repository::RepositoryError;

use super::capacity::check_admission;
use super::{EngineError, SchedulingEngine, validate_id, validate_interval};

impl SchedulingEngine {
    /// Admit a booking request as a new `Pending` appointment, or say why not.
    pub async fn request_booking(&self, request: BookingRequest) -> Result<Appointment, EngineError> {
        validate_request(&request)?;
        let started = Instant::now();

        let engine = self.clone();
        let provider_id = request.provider_id.clone();
        let result = self
            .inner
            .guard
            .with_provider_lock(&provider_id, self.inner.lock_wait, async move {
                engine.admit(request).await
            })
            .await;

        metrics::histogram!(crate::observability::BOOKING_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        metrics::counter!(
            crate::observability::BOOKINGS_TOTAL,
            "outcome" => crate::observability::outcome_label(&result)
        )
        .increment(1);

        match &result {
            Ok(appt) => {
                info!(
                    appointment_id = %appt.appointment_id,
                    provider_id = %appt.provider_id,
                    patient_id = %appt.patient_id,
                    "booking admitted"
                );
                self.dispatch(SchedulingEvent {
                    kind: EventKind::BookingCreated,
                    appointment: appt.clone(),
                    at: appt.created_at,
                });
            }
            Err(e) if e.is_rejection() => debug!(%provider_id, "booking rejected: {e}"),
            Err(e) => warn!(%provider_id, "booking failed: {e}"),
        }
        result
    }

    /// Check-then-save. Runs inside the provider's critical section.
    async fn admit(&self, request: BookingRequest) -> Result<Appointment, EngineError> {
        let mut conflicts = 0u32;
        loop {
            let slots = self
                .inner
                .calendar
                .find_covering_slots(&request.provider_id, &request.interval)
                .await;
            if slots.is_empty() {
                return Err(EngineError::NoAvailability);
            }

            let active: Vec<Interval> = self
                .inner
                .repository
                .load_active_appointments(&request.provider_id, &request.interval)
                .await?
                .into_iter()
                .map(|a| a.interval)
                .collect();
            check_admission(&slots, &active, &request.interval)?;

            let appt = Appointment::new_pending(&request, self.now());
            match self.inner.repository.save(&appt).await {
                Ok(()) => return Ok(appt),
                Err(RepositoryError::Conflict(id)) => {
                    metrics::counter!(crate::observability::REPOSITORY_CONFLICTS_TOTAL).increment(1);
                    conflicts += 1;
                    if conflicts > self.inner.max_conflict_retries {
                        warn!(provider_id = %request.provider_id, %id, conflicts, "giving up after repository conflicts");
                        return Err(EngineError::SlotFull);
                    }
                    debug!(provider_id = %request.provider_id, %id, conflicts, "repository conflict, re-checking");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl SchedulingEngine {
    /// Move an active appointment to `interval`, keeping its id and status.
    /// The new interval is admitted like a fresh booking, except that the
    /// appointment does not compete with its own current interval.
    pub async fn reschedule_booking(
        &self,
        appointment_id: Ulid,
        interval: Interval,
    ) -> Result<Appointment, EngineError> {
        validate_interval(&interval, MAX_APPOINTMENT_DURATION_MS)?;
        let provider_id = self
            .inner
            .repository
            .load_appointment(appointment_id)
            .await?
            .ok_or(EngineError::NotFound(appointment_id))?
            .provider_id;

        let engine = self.clone();
        let result = self
            .inner
            .guard
            .with_provider_lock(&provider_id, self.inner.lock_wait, async move {
                engine.move_appointment(appointment_id, interval).await
            })
            .await;

        metrics::counter!(
            crate::observability::RESCHEDULES_TOTAL,
            "outcome" => crate::observability::outcome_label(&result)
        )
        .increment(1);

        match result {
            Ok((from, updated)) => {
                info!(%appointment_id, %provider_id, "appointment rescheduled");
                self.dispatch(SchedulingEvent {
                    kind: EventKind::Rescheduled {
                        from,
                        to: updated.interval,
                    },
                    appointment: updated.clone(),
                    at: updated.updated_at,
                });
                Ok(updated)
            }
            Err(e) => {
                debug!(%appointment_id, "reschedule refused: {e}");
                Err(e)
            }
        }
    }

    /// Runs inside the provider's critical section.
    async fn move_appointment(
        &self,
        appointment_id: Ulid,
        interval: Interval,
    ) -> Result<(Interval, Appointment), EngineError> {
        let current = self
            .inner
            .repository
            .load_appointment(appointment_id)
            .await?
            .ok_or(EngineError::NotFound(appointment_id))?;
        let updated = current.rescheduled(interval, self.now())?;

        let slots = self
            .inner
            .calendar
            .find_covering_slots(&current.provider_id, &interval)
            .await;
        if slots.is_empty() {
            return Err(EngineError::NoAvailability);
        }
        let others: Vec<Interval> = self
            .inner
            .repository
            .load_active_appointments(&current.provider_id, &interval)
            .await?
            .into_iter()
            .filter(|a| a.appointment_id != appointment_id)
            .map(|a| a.interval)
            .collect();
        check_admission(&slots, &others, &interval)?;

        self.inner.repository.save(&updated).await?;
        Ok((current.interval, updated))
    }
}

fn validate_request(request: &BookingRequest) -> Result<(), EngineError> {
    validate_id(&request.patient_id)?;
    validate_id(&request.provider_id)?;
    validate_interval(&request.interval, MAX_APPOINTMENT_DURATION_MS)?;
    if let Some(reason) = &request.reason
        && reason.len() > MAX_REASON_LEN
    {
        return Err(EngineError::LimitExceeded("reason too long"));
    }
    Ok(())
}

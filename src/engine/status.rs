use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;

use super::{EngineError, SchedulingEngine};

impl SchedulingEngine {
    pub async fn cancel_booking(&self, appointment_id: Ulid, actor: Actor) -> Result<Appointment, EngineError> {
        self.transition(appointment_id, AppointmentStatus::Cancelled, Some(actor))
            .await
    }

    pub async fn confirm_booking(&self, appointment_id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(appointment_id, AppointmentStatus::Confirmed, None)
            .await
    }

    /// Move an appointment to `new_status`. Cancellation through this call is
    /// attributed to `Actor::System`.
    pub async fn update_status(
        &self,
        appointment_id: Ulid,
        new_status: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        self.transition(appointment_id, new_status, None).await
    }

    async fn transition(
        &self,
        appointment_id: Ulid,
        target: AppointmentStatus,
        actor: Option<Actor>,
    ) -> Result<Appointment, EngineError> {
        // The provider is only known after a first read; the record is read
        // again under that provider's lock.
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
                let current = engine
                    .inner
                    .repository
                    .load_appointment(appointment_id)
                    .await?
                    .ok_or(EngineError::NotFound(appointment_id))?;
                let transition = Transition::leading_to(target).ok_or(EngineError::IllegalTransition {
                    from: current.status,
                    to: target,
                })?;
                let updated = current.transitioned(transition, actor, engine.now())?;
                engine.inner.repository.save(&updated).await?;
                Ok((current.status, updated))
            })
            .await;

        metrics::counter!(
            crate::observability::TRANSITIONS_TOTAL,
            "to" => target.as_str(),
            "outcome" => crate::observability::outcome_label(&result)
        )
        .increment(1);

        match result {
            Ok((from, updated)) => {
                info!(%appointment_id, %from, to = %updated.status, "appointment status changed");
                self.dispatch(SchedulingEvent {
                    kind: EventKind::StatusChanged {
                        from,
                        to: updated.status,
                    },
                    appointment: updated.clone(),
                    at: updated.updated_at,
                });
                Ok(updated)
            }
            Err(e) => {
                debug!(%appointment_id, to = %target, "transition refused: {e}");
                Err(e)
            }
        }
    }
}

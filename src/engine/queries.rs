use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::capacity::capacity_profile;
use super::{EngineError, SchedulingEngine, validate_id, validate_interval};

impl SchedulingEngine {
    pub async fn get_appointment(&self, appointment_id: Ulid) -> Result<Appointment, EngineError> {
        self.inner
            .repository
            .load_appointment(appointment_id)
            .await?
            .ok_or(EngineError::NotFound(appointment_id))
    }

    /// Every appointment of the patient, any status, ordered by start.
    pub async fn appointments_for_patient(&self, patient_id: &str) -> Result<Vec<Appointment>, EngineError> {
        validate_id(patient_id)?;
        Ok(self.inner.repository.appointments_for_patient(patient_id).await?)
    }

    /// Every appointment of the provider overlapping `window`, any status.
    pub async fn appointments_for_provider(
        &self,
        provider_id: &str,
        window: Interval,
    ) -> Result<Vec<Appointment>, EngineError> {
        validate_id(provider_id)?;
        validate_interval(&window, MAX_WINDOW_DURATION_MS)?;
        Ok(self
            .inner
            .repository
            .appointments_for_provider(provider_id, &window)
            .await?)
    }

    /// How many more appointments `interval` could take right now.
    pub async fn remaining_capacity(&self, provider_id: &str, interval: Interval) -> Result<u32, EngineError> {
        validate_id(provider_id)?;
        validate_interval(&interval, MAX_WINDOW_DURATION_MS)?;
        let active = self
            .inner
            .repository
            .load_active_appointments(provider_id, &interval)
            .await?;
        Ok(self
            .inner
            .calendar
            .remaining_capacity(provider_id, &interval, &active)
            .await)
    }

    /// Bookable stretches of the published slots overlapping `window`: for
    /// each slot, every maximal piece with constant headroom above zero.
    /// Fully booked slots produce nothing.
    pub async fn available_slots(&self, provider_id: &str, window: Interval) -> Result<Vec<OpenSlot>, EngineError> {
        validate_id(provider_id)?;
        validate_interval(&window, MAX_WINDOW_DURATION_MS)?;
        let in_window = self.inner.calendar.find_covering_slots(provider_id, &window).await;
        let (Some(first), Some(last_end)) = (
            in_window.first().map(|s| s.interval.start),
            in_window.iter().map(|s| s.interval.end).max(),
        ) else {
            return Ok(Vec::new());
        };

        // Slots may stick out of the window; stacked neighbours and
        // appointments are gathered over their full extent.
        let extent = Interval {
            start: first,
            end: last_end,
        };
        let slots = self.inner.calendar.find_covering_slots(provider_id, &extent).await;
        let active: Vec<Interval> = self
            .inner
            .repository
            .load_active_appointments(provider_id, &extent)
            .await?
            .into_iter()
            .map(|a| a.interval)
            .collect();

        Ok(in_window
            .into_iter()
            .flat_map(|slot| {
                capacity_profile(&slots, &active, &slot.interval)
                    .into_iter()
                    .filter(|seg| seg.headroom() > 0)
                    .map(move |seg| OpenSlot {
                        slot: slot.clone(),
                        free: seg.interval,
                        remaining: seg.headroom(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect())
    }
}

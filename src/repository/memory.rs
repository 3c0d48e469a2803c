use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::model::*;

use super::{Repository, RepositoryError};

/// Appointments in DashMaps, with provider and patient indexes.
pub struct InMemoryRepository {
    appointments: DashMap<Ulid, Appointment>,
    /// Provider → (interval, id), sorted by interval start.
    by_provider: DashMap<ProviderId, Vec<(Interval, Ulid)>>,
    by_patient: DashMap<PatientId, Vec<Ulid>>,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            appointments: DashMap::new(),
            by_provider: DashMap::new(),
            by_patient: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.appointments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.appointments.is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<Appointment> {
        self.appointments.get(id).map(|e| e.value().clone())
    }

    /// Fails with `Conflict` unless `appointment` is the next version of what is stored.
    pub fn check_version(&self, appointment: &Appointment) -> Result<(), RepositoryError> {
        let stored = self
            .appointments
            .get(&appointment.appointment_id)
            .map(|e| e.version);
        if is_next_version(stored, appointment.version) {
            Ok(())
        } else {
            Err(RepositoryError::Conflict(appointment.appointment_id))
        }
    }

    /// Conditional write. The version check and the store happen under the
    /// same map entry lock.
    pub fn put(&self, appointment: &Appointment) -> Result<(), RepositoryError> {
        let id = appointment.appointment_id;
        match self.appointments.entry(id) {
            Entry::Vacant(slot) => {
                if appointment.version != 1 {
                    return Err(RepositoryError::Conflict(id));
                }
                slot.insert(appointment.clone());
            }
            Entry::Occupied(mut slot) => {
                if slot.get().version + 1 != appointment.version {
                    return Err(RepositoryError::Conflict(id));
                }
                let previous = slot.insert(appointment.clone());
                drop(slot);
                self.reindex(&previous, appointment);
                return Ok(());
            }
        }
        self.index(appointment);
        Ok(())
    }

    fn index(&self, appointment: &Appointment) {
        self.index_interval(&appointment.provider_id, appointment.interval, appointment.appointment_id);
        self.by_patient
            .entry(appointment.patient_id.clone())
            .or_default()
            .push(appointment.appointment_id);
    }

    fn index_interval(&self, provider_id: &str, interval: Interval, id: Ulid) {
        let mut ids = self.by_provider.entry(provider_id.to_string()).or_default();
        let pos = ids.partition_point(|(iv, _)| iv.start <= interval.start);
        ids.insert(pos, (interval, id));
    }

    /// Owners never change; a reschedule moves the provider index entry.
    fn reindex(&self, previous: &Appointment, current: &Appointment) {
        if previous.interval == current.interval {
            return;
        }
        let id = current.appointment_id;
        if let Some(mut ids) = self.by_provider.get_mut(&current.provider_id)
            && let Some(pos) = ids.iter().position(|&(iv, i)| i == id && iv == previous.interval)
        {
            ids.remove(pos);
        }
        self.index_interval(&current.provider_id, current.interval, id);
    }

    /// Apply a recovered record. Keeps whichever version is newer; returns
    /// false if the record was stale.
    pub(super) fn restore(&self, appointment: &Appointment) -> bool {
        match self.appointments.entry(appointment.appointment_id) {
            Entry::Occupied(slot) if slot.get().version >= appointment.version => false,
            Entry::Occupied(mut slot) => {
                let previous = slot.insert(appointment.clone());
                drop(slot);
                self.reindex(&previous, appointment);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(appointment.clone());
                self.index(appointment);
                true
            }
        }
    }

    /// Snapshot of every stored appointment, in no particular order.
    pub fn snapshot(&self) -> Vec<Appointment> {
        self.appointments.iter().map(|e| e.value().clone()).collect()
    }

    fn provider_overlapping(&self, provider_id: &str, window: &Interval) -> Vec<Appointment> {
        // Copy ids out first; never hold an index guard while reading `appointments`.
        let ids: Vec<Ulid> = match self.by_provider.get(provider_id) {
            Some(entries) => {
                let right_bound = entries.partition_point(|(iv, _)| iv.start < window.end);
                entries[..right_bound]
                    .iter()
                    .filter(|(iv, _)| iv.end > window.start)
                    .map(|(_, id)| *id)
                    .collect()
            }
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }
}

pub(super) fn is_next_version(stored: Option<u64>, incoming: u64) -> bool {
    match stored {
        None => incoming == 1,
        Some(v) => v + 1 == incoming,
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn load_active_appointments(
        &self,
        provider_id: &str,
        interval: &Interval,
    ) -> Result<Vec<Appointment>, RepositoryError> {
        let mut found = self.provider_overlapping(provider_id, interval);
        found.retain(|a| a.is_active() && a.interval.overlaps(interval));
        Ok(found)
    }

    async fn save(&self, appointment: &Appointment) -> Result<(), RepositoryError> {
        self.put(appointment)
    }

    async fn load_appointment(&self, appointment_id: Ulid) -> Result<Option<Appointment>, RepositoryError> {
        Ok(self.get(&appointment_id))
    }

    async fn appointments_for_patient(&self, patient_id: &str) -> Result<Vec<Appointment>, RepositoryError> {
        let ids: Vec<Ulid> = self
            .by_patient
            .get(patient_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut found: Vec<Appointment> = ids.iter().filter_map(|id| self.get(id)).collect();
        found.sort_by_key(|a| (a.interval.start, a.appointment_id));
        Ok(found)
    }

    async fn appointments_for_provider(
        &self,
        provider_id: &str,
        window: &Interval,
    ) -> Result<Vec<Appointment>, RepositoryError> {
        Ok(self.provider_overlapping(provider_id, window))
    }
}

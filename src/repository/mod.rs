mod memory;
mod wal;

pub use memory::InMemoryRepository;
pub use wal::{Wal, WalRepository};

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::{Appointment, Interval};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// A concurrent write got there first: the stored version is not the one
    /// this write was based on.
    Conflict(Ulid),
    /// The backing store could not be reached or failed to persist.
    Unavailable(String),
}

impl std::fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepositoryError::Conflict(id) => write!(f, "version conflict on appointment: {id}"),
            RepositoryError::Unavailable(e) => write!(f, "repository unavailable: {e}"),
        }
    }
}

impl std::error::Error for RepositoryError {}

/// Durable source of truth for appointments.
///
/// `save` is a conditional write: version 1 succeeds only if the id is new,
/// version N only if the stored version is N - 1.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Pending/Confirmed appointments of `provider_id` overlapping `interval`.
    async fn load_active_appointments(
        &self,
        provider_id: &str,
        interval: &Interval,
    ) -> Result<Vec<Appointment>, RepositoryError>;

    async fn save(&self, appointment: &Appointment) -> Result<(), RepositoryError>;

    async fn load_appointment(&self, appointment_id: Ulid) -> Result<Option<Appointment>, RepositoryError>;

    /// Every appointment of the patient, any status, ordered by start.
    async fn appointments_for_patient(&self, patient_id: &str) -> Result<Vec<Appointment>, RepositoryError>;

    /// Every appointment of the provider overlapping `window`, any status, ordered by start.
    async fn appointments_for_provider(
        &self,
        provider_id: &str,
        window: &Interval,
    ) -> Result<Vec<Appointment>, RepositoryError>;
}

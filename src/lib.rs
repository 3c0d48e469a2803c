pub mod calendar;
pub mod clock;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod guard;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod repository;

pub use calendar::{AvailabilityCalendar, AvailabilitySource, SlotOverlapPolicy};
pub use config::Config;
pub use engine::{EngineError, SchedulingEngine};
pub use model::*;
pub use notify::{LogNotifier, Notifier, NotifyHub};
pub use repository::{InMemoryRepository, Repository, RepositoryError, WalRepository};

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::engine::{EngineError, find_overlap, remaining_capacity};
use crate::model::*;

/// How `publish` treats input slots that overlap each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotOverlapPolicy {
    /// Overlapping input slots are an `InvalidSlotSet`.
    #[default]
    Reject,
    /// Overlapping slots are kept; capacities add up where they overlap.
    Stack,
}

impl std::str::FromStr for SlotOverlapPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(SlotOverlapPolicy::Reject),
            "stack" => Ok(SlotOverlapPolicy::Stack),
            other => Err(format!("unknown slot overlap policy: {other}")),
        }
    }
}

/// Where the engine learns when a provider can be booked.
#[async_trait]
pub trait AvailabilitySource: Send + Sync {
    /// Replace every slot of `provider_id` intersecting `period` with `slots`.
    async fn publish(
        &self,
        provider_id: &str,
        period: &Interval,
        slots: Vec<AvailabilitySlot>,
    ) -> Result<PublishOutcome, EngineError>;

    /// All slots overlapping `interval`, sorted by start. Empty means nothing is offered.
    async fn find_covering_slots(&self, provider_id: &str, interval: &Interval) -> Vec<AvailabilitySlot>;

    /// Minimum headroom over `interval` given the provider's active appointments.
    async fn remaining_capacity(
        &self,
        provider_id: &str,
        interval: &Interval,
        active_appointments: &[Appointment],
    ) -> u32 {
        let slots = self.find_covering_slots(provider_id, interval).await;
        let active: Vec<Interval> = active_appointments
            .iter()
            .filter(|a| a.is_active() && a.provider_id == provider_id)
            .map(|a| a.interval)
            .collect();
        remaining_capacity(&slots, &active, interval)
    }
}

// ── Per-provider slot set ────────────────────────────────────────

/// A provider's slots, sorted by start time.
#[derive(Debug, Default)]
pub struct ProviderSlots {
    slots: Vec<AvailabilitySlot>,
}

impl ProviderSlots {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Insert maintaining sort order by start.
    fn insert(&mut self, slot: AvailabilitySlot) {
        let pos = self
            .slots
            .partition_point(|s| s.interval.start <= slot.interval.start);
        self.slots.insert(pos, slot);
    }

    /// Slots overlapping `query`. Binary search skips slots starting at or after `query.end`.
    pub fn overlapping(&self, query: &Interval) -> impl Iterator<Item = &AvailabilitySlot> {
        let right_bound = self.slots.partition_point(|s| s.interval.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.interval.end > query.start)
    }

    /// Drop every slot intersecting `period`, then insert `new`. Returns the number removed.
    fn replace(&mut self, period: &Interval, new: Vec<AvailabilitySlot>) -> usize {
        let before = self.slots.len();
        self.slots.retain(|s| !s.interval.overlaps(period));
        let removed = before - self.slots.len();
        for slot in new {
            self.insert(slot);
        }
        removed
    }
}

pub type SharedProviderSlots = Arc<RwLock<ProviderSlots>>;

// ── Calendar ─────────────────────────────────────────────────────

/// In-memory availability calendar: one independently locked slot set per provider.
pub struct AvailabilityCalendar {
    providers: DashMap<ProviderId, SharedProviderSlots>,
    policy: SlotOverlapPolicy,
}

impl Default for AvailabilityCalendar {
    fn default() -> Self {
        Self::new(SlotOverlapPolicy::default())
    }
}

impl AvailabilityCalendar {
    pub fn new(policy: SlotOverlapPolicy) -> Self {
        Self {
            providers: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> SlotOverlapPolicy {
        self.policy
    }

    pub fn providers(&self) -> Vec<ProviderId> {
        self.providers.iter().map(|e| e.key().clone()).collect()
    }

    fn get(&self, provider_id: &str) -> Option<SharedProviderSlots> {
        self.providers.get(provider_id).map(|e| e.value().clone())
    }

    /// Every slot of the provider overlapping `window`.
    pub async fn slots(&self, provider_id: &str, window: &Interval) -> Vec<AvailabilitySlot> {
        let Some(ps) = self.get(provider_id) else {
            return Vec::new();
        };
        let guard = ps.read().await;
        guard.overlapping(window).cloned().collect()
    }

    fn validate(&self, provider_id: &str, period: &Interval, slots: &[AvailabilitySlot]) -> Result<(), EngineError> {
        use crate::limits::*;
        period.validate()?;
        if period.start < MIN_VALID_TIMESTAMP_MS || period.end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        if period.duration_ms() > MAX_WINDOW_DURATION_MS {
            return Err(EngineError::LimitExceeded("publish period too wide"));
        }
        if slots.len() > MAX_SLOTS_PER_PUBLISH {
            return Err(EngineError::LimitExceeded("too many slots in one publish"));
        }

        for slot in slots {
            slot.interval.validate()?;
            if slot.provider_id != provider_id {
                return Err(EngineError::InvalidSlotSet(format!(
                    "slot belongs to provider {}, not {provider_id}",
                    slot.provider_id
                )));
            }
            if slot.capacity < 1 {
                return Err(EngineError::InvalidSlotSet(format!(
                    "slot [{}, {}) has zero capacity",
                    slot.interval.start, slot.interval.end
                )));
            }
            if slot.capacity > MAX_SLOT_CAPACITY {
                return Err(EngineError::LimitExceeded("slot capacity too large"));
            }
            if !period.contains_interval(&slot.interval) {
                return Err(EngineError::InvalidSlotSet(format!(
                    "slot [{}, {}) lies outside the published period [{}, {})",
                    slot.interval.start, slot.interval.end, period.start, period.end
                )));
            }
        }

        if self.policy == SlotOverlapPolicy::Reject {
            let intervals: Vec<Interval> = slots.iter().map(|s| s.interval).collect();
            if let Some((a, b)) = find_overlap(&intervals) {
                return Err(EngineError::InvalidSlotSet(format!(
                    "slots [{}, {}) and [{}, {}) overlap",
                    a.start, a.end, b.start, b.end
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AvailabilitySource for AvailabilityCalendar {
    async fn publish(
        &self,
        provider_id: &str,
        period: &Interval,
        slots: Vec<AvailabilitySlot>,
    ) -> Result<PublishOutcome, EngineError> {
        self.validate(provider_id, period, &slots)?;

        let ps = self
            .providers
            .entry(provider_id.to_string())
            .or_default()
            .value()
            .clone();
        let mut guard = ps.write().await;
        let inserted = slots.len();
        let removed = guard.replace(period, slots);
        debug!(provider_id, removed, inserted, "availability published");
        Ok(PublishOutcome { removed, inserted })
    }

    async fn find_covering_slots(&self, provider_id: &str, interval: &Interval) -> Vec<AvailabilitySlot> {
        self.slots(provider_id, interval).await
    }
}

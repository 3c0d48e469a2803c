use crate::model::*;

use super::EngineError;

// ── Capacity Profile ──────────────────────────────────────────────

/// An elementary piece of a window over which both the offered capacity and
/// the number of overlapping active appointments are constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub interval: Interval,
    pub capacity: u32,
    pub occupied: u32,
}

impl Segment {
    pub fn headroom(&self) -> u32 {
        self.capacity.saturating_sub(self.occupied)
    }

    pub fn is_covered(&self) -> bool {
        self.capacity > 0
    }
}

/// Sweep-line over slot edges (+capacity/-capacity) and appointment edges
/// (+1/-1), clamped to `window`. Returns contiguous segments tiling the whole
/// window, including uncovered gaps (capacity 0).
pub fn capacity_profile(slots: &[AvailabilitySlot], active: &[Interval], window: &Interval) -> Vec<Segment> {
    // (time, capacity delta, occupancy delta)
    let mut events: Vec<(Ms, i64, i64)> = Vec::with_capacity((slots.len() + active.len()) * 2 + 2);
    for slot in slots {
        if let Some(clamped) = slot.interval.intersection(window) {
            events.push((clamped.start, slot.capacity as i64, 0));
            events.push((clamped.end, -(slot.capacity as i64), 0));
        }
    }
    for a in active {
        if let Some(clamped) = a.intersection(window) {
            events.push((clamped.start, 0, 1));
            events.push((clamped.end, 0, -1));
        }
    }
    events.sort_by_key(|e| e.0);

    let mut segments = Vec::new();
    let mut capacity: i64 = 0;
    let mut occupied: i64 = 0;
    let mut cursor = window.start;
    let mut i = 0;

    while i < events.len() {
        let time = events[i].0;
        if time > cursor {
            push_segment(&mut segments, cursor, time, capacity, occupied);
            cursor = time;
        }
        // Apply every edge at this instant before emitting the next segment.
        while i < events.len() && events[i].0 == time {
            capacity += events[i].1;
            occupied += events[i].2;
            i += 1;
        }
    }
    if cursor < window.end {
        push_segment(&mut segments, cursor, window.end, capacity, occupied);
    }

    segments
}

fn push_segment(out: &mut Vec<Segment>, start: Ms, end: Ms, capacity: i64, occupied: i64) {
    let capacity = capacity.max(0) as u32;
    let occupied = occupied.max(0) as u32;
    // Coalesce with the previous segment when nothing changed.
    if let Some(last) = out.last_mut()
        && last.interval.end == start
        && last.capacity == capacity
        && last.occupied == occupied
    {
        last.interval.end = end;
        return;
    }
    out.push(Segment {
        interval: Interval { start, end },
        capacity,
        occupied,
    });
}

/// Minimum headroom over every instant of `window`. Uncovered instants count
/// as capacity 0, so any gap yields 0.
pub fn remaining_capacity(slots: &[AvailabilitySlot], active: &[Interval], window: &Interval) -> u32 {
    capacity_profile(slots, active, window)
        .iter()
        .map(Segment::headroom)
        .min()
        .unwrap_or(0)
}

/// Admission rule for a new appointment over `requested`.
///
/// No covering slot at all is `NoAvailability`. A covered instant with no
/// headroom is `SlotFull`. A request that reaches past published availability
/// is `NoAvailability`.
pub fn check_admission(
    slots: &[AvailabilitySlot],
    active: &[Interval],
    requested: &Interval,
) -> Result<(), EngineError> {
    requested.validate()?;
    if slots.is_empty() {
        return Err(EngineError::NoAvailability);
    }
    let profile = capacity_profile(slots, active, requested);

    if profile.iter().any(|s| s.is_covered() && s.headroom() < 1) {
        return Err(EngineError::SlotFull);
    }
    if profile.iter().any(|s| !s.is_covered()) {
        return Err(EngineError::NoAvailability);
    }
    Ok(())
}

// ── Interval set helpers ──────────────────────────────────────────

/// First pair of overlapping intervals in an arbitrary list, if any.
pub fn find_overlap(intervals: &[Interval]) -> Option<(Interval, Interval)> {
    let mut sorted = intervals.to_vec();
    sorted.sort_by_key(|s| (s.start, s.end));
    sorted
        .windows(2)
        .find(|w| w[0].overlaps(&w[1]))
        .map(|w| (w[0], w[1]))
}

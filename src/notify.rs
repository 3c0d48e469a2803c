use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::model::{AppointmentStatus, EventKind, Ms, ProviderId, SchedulingEvent};

const CHANNEL_CAPACITY: usize = 256;

/// Best-effort delivery of scheduling events. Implementations log their own
/// failures; nothing is reported back to the engine.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: SchedulingEvent);
}

/// Broadcast hub: one channel per provider.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<ProviderId, broadcast::Sender<SchedulingEvent>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a provider's events. Creates the channel if needed.
    pub fn subscribe(&self, provider_id: &str) -> broadcast::Receiver<SchedulingEvent> {
        let sender = self
            .channels
            .entry(provider_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send to the provider's subscribers. No-op if nobody is listening.
    pub fn send(&self, event: &SchedulingEvent) {
        if let Some(sender) = self.channels.get(&event.appointment.provider_id) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn remove(&self, provider_id: &str) {
        self.channels.remove(provider_id);
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    async fn notify(&self, event: SchedulingEvent) {
        self.send(&event);
    }
}

/// Outbound message body, one JSON object per event.
#[derive(Debug, Serialize)]
pub struct NotificationPayload<'a> {
    pub appointment_id: String,
    pub patient_id: &'a str,
    pub provider_id: &'a str,
    pub start_time: Ms,
    pub status: AppointmentStatus,
    pub message: String,
    pub timestamp: Ms,
}

impl<'a> NotificationPayload<'a> {
    pub fn from_event(event: &'a SchedulingEvent) -> Self {
        let appt = &event.appointment;
        let message = match event.kind {
            EventKind::BookingCreated => format!("appointment requested with {}", appt.provider_id),
            EventKind::StatusChanged { from, to } => format!("appointment {from} -> {to}"),
            EventKind::Rescheduled { from, to } => {
                format!("appointment moved from {} to {}", from.start, to.start)
            }
        };
        Self {
            appointment_id: appt.appointment_id.to_string(),
            patient_id: &appt.patient_id,
            provider_id: &appt.provider_id,
            start_time: appt.interval.start,
            status: appt.status,
            message,
            timestamp: event.at,
        }
    }
}

/// Writes each event as a JSON payload to the `slotguard::notify` log target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: SchedulingEvent) {
        match serde_json::to_string(&NotificationPayload::from_event(&event)) {
            Ok(json) => info!(target: "slotguard::notify", payload = %json, "notification"),
            Err(e) => warn!(
                target: "slotguard::notify",
                appointment_id = %event.appointment.appointment_id,
                "failed to encode notification: {e}"
            ),
        }
    }
}

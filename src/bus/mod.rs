pub mod events;

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::{debug, warn};

use events::{Alert, JobShopEvent, MachineStatus, Telemetry};
use events::{TOPIC_JOBSHOP, TOPIC_JOB_ALERTS, TOPIC_JOB_STATUS, TOPIC_JOB_TELEMETRY};

/// Write-only sink for everything the kernel publishes. Implementations
/// must never block the tick loop; delivery faults are absorbed here and
/// logged rather than propagated (the simulation carries on).
pub trait EventSink {
    fn publish_event(&mut self, event: JobShopEvent);
    fn publish_status(&mut self, status: MachineStatus);
    fn publish_telemetry(&mut self, sample: Telemetry);
}

/// One message on the outbound bus, tagged with its logical channel.
#[derive(Debug, Clone)]
pub enum BusMessage {
    Event(JobShopEvent),
    Status(MachineStatus),
    Telemetry(Telemetry),
}

impl BusMessage {
    pub fn topic(&self) -> &'static str {
        match self {
            BusMessage::Event(_) => TOPIC_JOBSHOP,
            BusMessage::Status(_) => TOPIC_JOB_STATUS,
            BusMessage::Telemetry(_) => TOPIC_JOB_TELEMETRY,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            BusMessage::Event(event) => serde_json::to_string(event),
            BusMessage::Status(status) => serde_json::to_string(status),
            BusMessage::Telemetry(sample) => serde_json::to_string(sample),
        }
    }
}

/// Bounded-channel publisher. `try_send` keeps every publish non-blocking;
/// when the consumer falls behind, telemetry is shed first while job-shop
/// events and statuses get one immediate retry before being dropped. The
/// latest status per machine is retained locally so a reconnecting
/// consumer can be replayed the fleet state.
pub struct ChannelPublisher {
    tx: mpsc::Sender<BusMessage>,
    retained: HashMap<String, MachineStatus>,
}

impl ChannelPublisher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BusMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                retained: HashMap::new(),
            },
            rx,
        )
    }

    pub fn retained(&self) -> impl Iterator<Item = (&String, &MachineStatus)> {
        self.retained.iter()
    }

    fn send(&self, message: BusMessage, lossy: bool) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                if lossy {
                    debug!(topic = message.topic(), "bus full, sample dropped");
                    return;
                }
                // One immediate retry in case the consumer just freed a
                // slot; still bounded, never blocks the tick.
                match self.tx.try_send(message) {
                    Ok(()) => {}
                    Err(TrySendError::Full(message)) => {
                        warn!(topic = message.topic(), "bus still full after retry, event dropped");
                    }
                    Err(TrySendError::Closed(message)) => {
                        debug!(topic = message.topic(), "bus closed, message dropped");
                    }
                }
            }
            Err(TrySendError::Closed(message)) => {
                debug!(topic = message.topic(), "bus closed, message dropped");
            }
        }
    }
}

impl EventSink for ChannelPublisher {
    fn publish_event(&mut self, event: JobShopEvent) {
        self.send(BusMessage::Event(event), false);
    }

    fn publish_status(&mut self, status: MachineStatus) {
        self.retained
            .insert(status.machine_id.clone(), status.clone());
        self.send(BusMessage::Status(status), false);
    }

    fn publish_telemetry(&mut self, sample: Telemetry) {
        self.send(BusMessage::Telemetry(sample), true);
    }
}

/// Inbound side of `job/alerts`. Raw payloads arrive as JSON strings from
/// whatever bridge feeds the channel; malformed ones are dropped with a
/// warning and the simulation state is untouched.
pub struct AlertInbox {
    rx: mpsc::Receiver<String>,
}

pub fn alert_feed(capacity: usize) -> (mpsc::Sender<String>, AlertInbox) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, AlertInbox { rx })
}

impl AlertInbox {
    pub fn drain(&mut self) -> Vec<Alert> {
        let mut alerts = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(raw) => match serde_json::from_str::<Alert>(&raw) {
                    Ok(alert) => alerts.push(alert),
                    Err(err) => {
                        warn!(
                            topic = TOPIC_JOB_ALERTS,
                            %err,
                            payload = raw.as_str(),
                            "malformed alert dropped"
                        );
                    }
                },
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        alerts
    }
}

/// Recording sink for tests: everything published lands in order, and
/// `sequence` keeps the interleaving across channels.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemorySink {
    pub events: Vec<JobShopEvent>,
    pub statuses: Vec<MachineStatus>,
    pub telemetry: Vec<Telemetry>,
    pub sequence: Vec<&'static str>,
}

#[cfg(test)]
impl EventSink for MemorySink {
    fn publish_event(&mut self, event: JobShopEvent) {
        self.events.push(event);
        self.sequence.push("event");
    }

    fn publish_status(&mut self, status: MachineStatus) {
        self.statuses.push(status);
        self.sequence.push("status");
    }

    fn publish_telemetry(&mut self, sample: Telemetry) {
        self.telemetry.push(sample);
        self.sequence.push("telemetry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::events::REASON_THRESHOLD_EXCEEDED;

    fn failed_event() -> JobShopEvent {
        JobShopEvent::Failed {
            timestamp: 7,
            machine_id: "A_1".to_string(),
            class: "A".to_string(),
            job_id: "JOB_3".to_string(),
            reason: REASON_THRESHOLD_EXCEEDED.to_string(),
            temperature: 101.25,
            vibration: 4.5,
        }
    }

    #[test]
    fn events_serialize_with_screaming_type_tag() {
        let json = BusMessage::Event(failed_event()).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "FAILED");
        assert_eq!(value["reason"], "threshold_exceeded");
        assert_eq!(value["temperature"], 101.25);
    }

    #[test]
    fn publisher_retains_last_status_per_machine() {
        let (mut publisher, mut rx) = ChannelPublisher::channel(8);
        let mut status = MachineStatus {
            timestamp: 1,
            machine_id: "B_1".to_string(),
            class_name: "B".to_string(),
            temperature: 50.0,
            vibration: 4.0,
            status: "Operational".to_string(),
            current_job: "IDLE".to_string(),
            temp_threshold: 110.0,
            vib_threshold: 18.0,
            power_kwh_total: 0.0,
        };
        publisher.publish_status(status.clone());
        status.timestamp = 2;
        status.temperature = 55.0;
        publisher.publish_status(status.clone());

        let (_, retained) = publisher.retained().next().unwrap();
        assert_eq!(retained.timestamp, 2);
        assert_eq!(retained.temperature, 55.0);
        // Both snapshots still flowed through the channel in order.
        assert!(matches!(rx.try_recv().unwrap(), BusMessage::Status(s) if s.timestamp == 1));
        assert!(matches!(rx.try_recv().unwrap(), BusMessage::Status(s) if s.timestamp == 2));
    }

    #[test]
    fn full_channel_retries_once_then_drops_without_blocking() {
        let (mut publisher, mut rx) = ChannelPublisher::channel(1);
        publisher.publish_event(failed_event());
        // Capacity exhausted with nothing draining: the retry also finds
        // the channel full and the event is dropped, immediately.
        publisher.publish_event(failed_event());
        publisher.publish_telemetry(Telemetry {
            timestamp: 1,
            class_name: "A".to_string(),
            machine_id: "A_1".to_string(),
            temperature_c: 42.0,
            vibration_rms_mm_s: 2.0,
            seq: 1,
        });
        assert!(matches!(rx.try_recv().unwrap(), BusMessage::Event(_)));
        assert!(rx.try_recv().is_err());

        // Once the consumer catches up, events flow again.
        publisher.publish_event(failed_event());
        assert!(matches!(rx.try_recv().unwrap(), BusMessage::Event(_)));
    }

    #[test]
    fn closed_channel_is_absorbed_silently() {
        let (mut publisher, rx) = ChannelPublisher::channel(1);
        drop(rx);
        publisher.publish_event(failed_event());
        publisher.publish_status(MachineStatus {
            timestamp: 1,
            machine_id: "A_1".to_string(),
            class_name: "A".to_string(),
            temperature: 40.0,
            vibration: 2.0,
            status: "Operational".to_string(),
            current_job: "IDLE".to_string(),
            temp_threshold: 100.0,
            vib_threshold: 16.0,
            power_kwh_total: 0.0,
        });
        // The retained cache still tracks the fleet for a reconnect.
        assert_eq!(publisher.retained().count(), 1);
    }

    #[test]
    fn malformed_alert_is_dropped() {
        let (tx, mut inbox) = alert_feed(4);
        tx.try_send("{not json".to_string()).unwrap();
        tx.try_send(
            serde_json::json!({
                "timestamp": "2025-01-01T00:00:00Z",
                "machine_id": "C_1",
                "risk_score": 0.91,
                "threshold": 0.5,
                "red_flag": true,
            })
            .to_string(),
        )
        .unwrap();

        let alerts = inbox.drain();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].machine_id, "C_1");
        assert!(alerts[0].red_flag);
    }
}

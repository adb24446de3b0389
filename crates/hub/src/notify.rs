//! Fire-and-forget notification sink.
//!
//! Notifications go out on zone add/remove, schedule generation and
//! schedule completion. A sink failure is logged and swallowed; it never
//! fails the operation that triggered it.

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub severity: Severity,
}

impl Notification {
    pub fn new(title: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            severity,
        }
    }
}

pub trait Notifier: Send + Sync {
    /// Must not block and must not panic.
    fn notify(&self, notification: Notification);
}

// ---------------------------------------------------------------------------
// Log sink (default)
// ---------------------------------------------------------------------------

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: Notification) {
        info!(
            title = %n.title,
            severity = ?n.severity,
            "notification: {}",
            n.message
        );
    }
}

// ---------------------------------------------------------------------------
// MQTT sink
// ---------------------------------------------------------------------------

pub struct MqttNotifier {
    client: AsyncClient,
    topic: String,
}

impl MqttNotifier {
    pub fn new(client: AsyncClient, topic: impl Into<String>) -> Self {
        Self {
            client,
            topic: topic.into(),
        }
    }

    /// Build the client and spawn its event loop. The loop reconnects on its
    /// own; publishes made while disconnected are queued up to the channel
    /// capacity and dropped beyond it.
    pub fn connect(cfg: &MqttConfig) -> Self {
        let mut opts = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        opts.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(opts, 20);
        let host = cfg.host.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(broker = %host, "mqtt connected");
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!(broker = %host, "mqtt disconnected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(broker = %host, "mqtt error: {e}. reconnecting...");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self::new(client, cfg.topic.clone())
    }
}

impl Notifier for MqttNotifier {
    fn notify(&self, n: Notification) {
        let payload = match serde_json::to_vec(&n) {
            Ok(p) => p,
            Err(e) => {
                warn!("notify: failed to encode notification: {e}");
                return;
            }
        };
        match self
            .client
            .try_publish(self.topic.clone(), QoS::AtLeastOnce, false, payload)
        {
            Ok(()) => debug!(topic = %self.topic, title = %n.title, "notification queued"),
            Err(e) => warn!(topic = %self.topic, "notify: publish dropped: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Recording sink (tests)
// ---------------------------------------------------------------------------

#[cfg(test)]
#[derive(Default)]
pub struct RecordingNotifier {
    sent: std::sync::Mutex<Vec<Notification>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn titles(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|n| n.title.clone())
            .collect()
    }
}

#[cfg(test)]
impl Notifier for RecordingNotifier {
    fn notify(&self, n: Notification) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(n);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! Notification fan-out to `/1.0/events` subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use lxd_shim_core::{Error, EventSettings, Result};

use crate::response::OperationMetadata;

const EVENT_BUFFER: usize = 256;

/// Kind of notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Operation progress
    Operation,
    /// Instance lifecycle
    Lifecycle,
}

impl EventType {
    /// Wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Operation => "operation",
            EventType::Lifecycle => "lifecycle",
        }
    }
}

/// One notification envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Notification kind
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// Kind-specific payload
    pub metadata: serde_json::Value,
    /// Cluster location
    pub location: String,
    /// Project name
    pub project: String,
}

/// Who triggered a lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct Requestor {
    /// User name
    pub username: String,
    /// Protocol
    pub protocol: String,
    /// Remote address
    pub address: String,
}

/// Lifecycle context.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleContext {
    /// Command being run
    pub command: Vec<String>,
}

/// Lifecycle event payload.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleMetadata {
    /// e.g. `instance-exec`
    pub action: String,
    /// Instance URL
    pub source: String,
    /// Extra detail
    pub context: LifecycleContext,
    /// Requestor identity
    pub requestor: Requestor,
    /// Instance name
    pub name: String,
    /// Project name
    pub project: String,
}

/// Broadcasts events to every attached subscriber.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    settings: EventSettings,
}

impl EventBus {
    /// Create a bus stamping envelopes with `settings`.
    pub fn new(settings: EventSettings) -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender, settings }
    }

    /// Envelope settings.
    pub fn settings(&self) -> &EventSettings {
        &self.settings
    }

    /// Attach a new subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Send an event to every subscriber, returning how many received it.
    pub fn publish(&self, event: Event) -> Result<usize> {
        self.sender.send(event).map_err(|_| Error::NoSubscriber)
    }

    /// Publish an operation notification.
    pub fn operation(&self, metadata: OperationMetadata) -> Result<usize> {
        let metadata = serde_json::to_value(metadata)?;
        self.publish(self.envelope(EventType::Operation, metadata))
    }

    /// Publish a lifecycle notification for `instance`.
    pub fn lifecycle(&self, action: &str, instance: &str, command: &[String]) -> Result<usize> {
        let metadata = LifecycleMetadata {
            action: action.to_string(),
            source: format!("/1.0/instances/{instance}"),
            context: LifecycleContext {
                command: command.to_vec(),
            },
            requestor: Requestor {
                username: self.settings.requestor_username.clone(),
                protocol: self.settings.requestor_protocol.clone(),
                address: self.settings.requestor_address.clone(),
            },
            name: instance.to_string(),
            project: self.settings.project.clone(),
        };
        let metadata = serde_json::to_value(metadata)?;
        self.publish(self.envelope(EventType::Lifecycle, metadata))
    }

    fn envelope(&self, event_type: EventType, metadata: serde_json::Value) -> Event {
        Event {
            event_type,
            timestamp: Utc::now(),
            metadata,
            location: self.settings.location.clone(),
            project: self.settings.project.clone(),
        }
    }
}

/// Log and drop the result of a best-effort publish.
pub fn best_effort(what: &str, result: Result<usize>) {
    match result {
        Ok(count) => debug!("Published {} event to {} subscribers", what, count),
        Err(Error::NoSubscriber) => debug!("No subscriber for {} event", what),
        Err(e) => debug!("Dropped {} event: {}", what, e),
    }
}

/// Which event types a subscriber wants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    types: Option<Vec<EventType>>,
}

impl EventFilter {
    /// Parse a comma-separated `type` query value; empty or absent means all.
    ///
    /// Unknown type names are ignored.
    pub fn parse(query: Option<&str>) -> Self {
        let Some(query) = query.filter(|q| !q.trim().is_empty()) else {
            return Self::default();
        };
        let types = query
            .split(',')
            .filter_map(|name| match name.trim() {
                "operation" => Some(EventType::Operation),
                "lifecycle" => Some(EventType::Lifecycle),
                _ => None,
            })
            .collect();
        Self { types: Some(types) }
    }

    /// Whether `event` passes the filter.
    pub fn accepts(&self, event: &Event) -> bool {
        match &self.types {
            None => true,
            Some(types) => types.contains(&event.event_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lxd_shim_core::{Operation, OperationClass};

    fn bus() -> EventBus {
        EventBus::new(EventSettings::default())
    }

    #[test]
    fn test_publish_without_subscriber() {
        let result = bus().lifecycle("instance-exec", "web1", &[]);
        assert!(matches!(result, Err(Error::NoSubscriber)));
    }

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let bus = bus();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let op = Operation::new(OperationClass::Task, "web1", "Starting instance");
        let count = bus
            .operation(OperationMetadata::new(&op, None, "none"))
            .unwrap();
        assert_eq!(count, 2);

        for rx in [&mut first, &mut second] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.event_type, EventType::Operation);
            assert_eq!(event.metadata["id"], op.id.to_string());
        }
    }

    #[tokio::test]
    async fn test_lifecycle_envelope() {
        let bus = bus();
        let mut rx = bus.subscribe();
        bus.lifecycle("instance-exec", "web1", &["ls".to_string()])
            .unwrap();

        let json = serde_json::to_value(rx.recv().await.unwrap()).unwrap();
        assert_eq!(json["type"], "lifecycle");
        assert_eq!(json["location"], "none");
        assert_eq!(json["project"], "default");
        assert_eq!(json["metadata"]["action"], "instance-exec");
        assert_eq!(json["metadata"]["source"], "/1.0/instances/web1");
        assert_eq!(json["metadata"]["context"]["command"][0], "ls");
        assert_eq!(json["metadata"]["requestor"]["protocol"], "tls");
        assert_eq!(json["metadata"]["name"], "web1");
    }

    #[test]
    fn test_filter() {
        let event = bus().envelope(EventType::Lifecycle, serde_json::Value::Null);

        assert!(EventFilter::parse(None).accepts(&event));
        assert!(EventFilter::parse(Some("")).accepts(&event));
        assert!(EventFilter::parse(Some("operation, lifecycle")).accepts(&event));
        assert!(!EventFilter::parse(Some("operation")).accepts(&event));
        assert!(!EventFilter::parse(Some("logging")).accepts(&event));
    }
}

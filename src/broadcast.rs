//! Best-effort fan-out of position updates and alerts.
//!
//! Events go to named channels: `global` for every accepted position,
//! `vehicle/{id}` for one vehicle's positions and `user/{id}` for one user's
//! alerts. Nothing is buffered for listeners that subscribe later, and no
//! delivery is acknowledged.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    errors::TrackerError,
    models::{Alert, UserId, VehicleId, VehicleLocation},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Global,
    Vehicle(VehicleId),
    User(UserId),
}

impl Channel {
    pub fn name(&self) -> String {
        match self {
            Self::Global => "global".to_string(),
            Self::Vehicle(id) => format!("vehicle/{}", id),
            Self::User(id) => format!("user/{}", id),
        }
    }
}

/// Position payload sent to listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpdate {
    pub vehicle_id: VehicleId,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl From<&VehicleLocation> for PositionUpdate {
    fn from(location: &VehicleLocation) -> Self {
        Self {
            vehicle_id: location.vehicle_id.clone(),
            latitude: location.latitude,
            longitude: location.longitude,
            speed: location.speed,
            heading: location.heading,
            timestamp: location.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum BroadcastEvent {
    Location(PositionUpdate),
    Alert(Alert),
}

/// Transport that delivers an event to a named channel.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, channel: &Channel, event: &BroadcastEvent) -> Result<(), TrackerError>;
}

/// In-process subscription registry keyed by channel name.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, broadcast::Sender<BroadcastEvent>>>,
    capacity: usize,
}

impl ChannelRegistry {
    /// `capacity` is the per-channel backlog a slow receiver may lag behind.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Receive events published to `channel` from now on.
    pub fn subscribe(
        &self,
        channel: &Channel,
    ) -> Result<broadcast::Receiver<BroadcastEvent>, TrackerError> {
        let mut channels = self
            .channels
            .write()
            .map_err(|_| TrackerError::Broadcast("channel registry lock poisoned".to_string()))?;

        let sender = channels
            .entry(channel.name())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(sender.subscribe())
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.channels
            .read()
            .ok()
            .and_then(|channels| channels.get(&channel.name()).map(|s| s.receiver_count()))
            .unwrap_or(0)
    }
}

#[async_trait]
impl Publisher for ChannelRegistry {
    async fn publish(&self, channel: &Channel, event: &BroadcastEvent) -> Result<(), TrackerError> {
        let name = channel.name();
        let mut channels = self
            .channels
            .write()
            .map_err(|_| TrackerError::Broadcast("channel registry lock poisoned".to_string()))?;

        let closed = channels
            .get(&name)
            .map_or(false, |sender| sender.send(event.clone()).is_err());
        if closed {
            // Every receiver is gone.
            channels.remove(&name);
        }
        Ok(())
    }
}

/// Publishes each event through every configured transport.
///
/// A failing transport is logged and skipped; it never fails the caller.
pub struct FanOut {
    publishers: Vec<Arc<dyn Publisher>>,
}

impl FanOut {
    pub fn new(publishers: Vec<Arc<dyn Publisher>>) -> Self {
        Self { publishers }
    }

    /// Send a position to the global and the vehicle channel.
    pub async fn publish_location(&self, location: &VehicleLocation) {
        let event = BroadcastEvent::Location(PositionUpdate::from(location));
        self.publish(&Channel::Global, &event).await;
        self.publish(&Channel::Vehicle(location.vehicle_id.clone()), &event)
            .await;
    }

    /// Send an alert to its owner's channel.
    pub async fn publish_alert(&self, alert: &Alert) {
        let event = BroadcastEvent::Alert(alert.clone());
        self.publish(&Channel::User(alert.user_id.clone()), &event)
            .await;
    }

    async fn publish(&self, channel: &Channel, event: &BroadcastEvent) {
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(channel, event).await {
                warn!("Broadcast to {} failed: {}", channel.name(), e);
            }
        }
        debug!("Broadcast to {}", channel.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use tokio::sync::broadcast::error::TryRecvError;

    struct BrokenPublisher;

    #[async_trait]
    impl Publisher for BrokenPublisher {
        async fn publish(
            &self,
            _channel: &Channel,
            _event: &BroadcastEvent,
        ) -> Result<(), TrackerError> {
            Err(TrackerError::Broadcast("transport down".to_string()))
        }
    }

    fn location(id: &str) -> VehicleLocation {
        VehicleLocation {
            vehicle_id: VehicleId::try_from(id).unwrap(),
            latitude: 37.5665,
            longitude: 126.978,
            altitude: None,
            speed: Some(30.0),
            heading: None,
            accuracy: None,
            timestamp: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_location_reaches_global_and_vehicle_channels() {
        let registry = Arc::new(ChannelRegistry::new(16));
        let v1 = Channel::Vehicle(VehicleId::try_from("V1").unwrap());
        let v2 = Channel::Vehicle(VehicleId::try_from("V2").unwrap());
        let mut global_rx = registry.subscribe(&Channel::Global).unwrap();
        let mut v1_rx = registry.subscribe(&v1).unwrap();
        let mut v2_rx = registry.subscribe(&v2).unwrap();

        let fanout = FanOut::new(vec![registry.clone() as Arc<dyn Publisher>]);
        fanout.publish_location(&location("V1")).await;

        match global_rx.try_recv().unwrap() {
            BroadcastEvent::Location(update) => assert_eq!(update.vehicle_id.as_str(), "V1"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(v1_rx.try_recv(), Ok(BroadcastEvent::Location(_))));
        assert!(matches!(v2_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let registry = Arc::new(ChannelRegistry::new(16));
        let fanout = FanOut::new(vec![registry.clone() as Arc<dyn Publisher>]);

        fanout.publish_location(&location("V1")).await;
        let mut late_rx = registry.subscribe(&Channel::Global).unwrap();

        assert!(matches!(late_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_alert_reaches_user_channel() {
        let registry = Arc::new(ChannelRegistry::new(16));
        let user = UserId::new("U1");
        let mut user_rx = registry.subscribe(&Channel::User(user.clone())).unwrap();

        let alert = Alert {
            id: 1,
            user_id: user,
            vehicle_id: VehicleId::try_from("V1").unwrap(),
            kind: "geofence_enter".to_string(),
            title: "Entered depot".to_string(),
            message: "Vehicle V1 entered depot".to_string(),
            severity: Severity::Info,
            created_at: Utc::now(),
        };
        let fanout = FanOut::new(vec![registry.clone() as Arc<dyn Publisher>]);
        fanout.publish_alert(&alert).await;

        assert_eq!(user_rx.try_recv().unwrap(), BroadcastEvent::Alert(alert));
    }

    #[tokio::test]
    async fn test_failing_transport_does_not_block_others() {
        let registry = Arc::new(ChannelRegistry::new(16));
        let mut rx = registry.subscribe(&Channel::Global).unwrap();

        let fanout = FanOut::new(vec![
            Arc::new(BrokenPublisher) as Arc<dyn Publisher>,
            registry.clone() as Arc<dyn Publisher>,
        ]);
        fanout.publish_location(&location("V1")).await;

        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_channel_dropped_when_receivers_leave() {
        let registry = ChannelRegistry::new(4);
        let rx = registry.subscribe(&Channel::Global).unwrap();
        assert_eq!(registry.subscriber_count(&Channel::Global), 1);
        drop(rx);

        let event = BroadcastEvent::Location(PositionUpdate::from(&location("V1")));
        registry.publish(&Channel::Global, &event).await.unwrap();
        assert_eq!(registry.subscriber_count(&Channel::Global), 0);
    }

    #[test]
    fn test_event_json_shape() {
        let event = BroadcastEvent::Location(PositionUpdate::from(&location("V9")));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "location");
        assert_eq!(value["data"]["vehicleId"], "V9");
    }
}

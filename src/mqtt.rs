//! MQTT client implementation
//!
//! Devices publish JSON position reports to `vehicles/{id}/location`.
//! Accepted positions and alerts are republished to `{prefix}/{channel}`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};

use crate::{
    broadcast::{BroadcastEvent, Channel, Publisher},
    config::{MqttConfig, MqttTransport},
    errors::TrackerError,
    models::LocationReport,
};

const TOPIC_ROOT: &str = "vehicles";

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// MQTT client for receiving position reports
pub struct MqttClientBuilder {
    client: AsyncClient,
    event_loop: EventLoop,
    tx: mpsc::Sender<Result<LocationReport, TrackerError>>,
    rx: mpsc::Receiver<Result<LocationReport, TrackerError>>,
}

pub struct MqttClient {
    client: AsyncClient,
    rx: mpsc::Receiver<Result<LocationReport, TrackerError>>,
    _topics: Vec<String>,
    _handle: tokio::task::JoinHandle<Result<(), TrackerError>>,
}

impl MqttClientBuilder {
    /// Create a new MQTT client
    pub fn new(config: &MqttConfig) -> Result<Self, TrackerError> {
        config.validate()?;

        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
        match config.transport {
            MqttTransport::Tcp => {}
            MqttTransport::Tls => {
                mqtt_options.set_transport(Transport::tls_with_default_config());
            }
            MqttTransport::Wss => {
                mqtt_options.set_transport(Transport::wss_with_default_config());
            }
        }
        mqtt_options.set_keep_alive(config.keep_alive);

        let (client, event_loop) = AsyncClient::new(mqtt_options, 100);

        // Create a channel for message passing
        let (tx, rx) = mpsc::channel(100);

        Ok(Self {
            client,
            event_loop,
            tx,
            rx,
        })
    }

    /// Connect to MQTT broker and subscribe to topics
    ///
    /// Note: Initial subscription needs not be done here, as it is done
    /// in the event loop.
    pub async fn connect(self, topics: &[String]) -> Result<MqttClient, TrackerError> {
        let topics = topics.to_vec();

        let _handle = tokio::spawn(Self::process_events(
            self.tx,
            self.event_loop,
            self.client.clone(),
            topics.clone(),
        ));

        Ok(MqttClient {
            client: self.client,
            rx: self.rx,
            _topics: topics,
            _handle,
        })
    }

    async fn subscribe(client: AsyncClient, topics: &[String]) -> Result<(), TrackerError> {
        for topic in topics.iter() {
            info!("Subscribing to topic: {}", topic);
            client.subscribe(topic, QoS::AtLeastOnce).await?;
        }
        Ok(())
    }

    /// Process MQTT events
    ///
    /// `rumqttc` reconnects on its own after a lost connection, but topic
    /// subscriptions must be re-established on every ConnAck.
    ///
    /// NOTE: If topic subscription fails, the loop will break and return an error.
    async fn process_events(
        tx: mpsc::Sender<Result<LocationReport, TrackerError>>,
        mut event_loop: EventLoop,
        client: AsyncClient,
        topics: Vec<String>,
    ) -> Result<(), TrackerError> {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker, subscribing to topics");
                    if let Err(e) = Self::subscribe(client.clone(), &topics).await {
                        error!("Failed to subscribe: {}", e);
                        break Err(e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    // Malformed reports still reach the receiver so that they
                    // are counted as rejected ingestions.
                    let report = parse_message(&publish.topic, &publish.payload);
                    if let Err(e) = &report {
                        warn!("Failed to parse message on {}: {}", publish.topic, e);
                    }
                    if tx.send(report).await.is_err() {
                        info!("Report receiver dropped, stopping MQTT event loop");
                        break Ok(());
                    }
                }
                Err(e) => {
                    error!("MQTT Error: {}", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
                _ => continue,
            }
        }
    }
}

/// Whether a subscription filter only matches `vehicles/{id}/location`
/// topics, with the id level either literal or `+`.
pub fn is_report_filter(filter: &str) -> bool {
    let levels: Vec<&str> = filter.split('/').collect();
    match levels.as_slice() {
        [root, id, "location"] if *root == TOPIC_ROOT => {
            *id == "+" || !(id.is_empty() || id.contains(['+', '#']))
        }
        _ => false,
    }
}

/// Parse a position report; the vehicle id is taken from the topic.
pub fn parse_message(topic: &str, payload: &[u8]) -> Result<LocationReport, TrackerError> {
    let parts: Vec<&str> = topic.split('/').collect();

    // Validate topic structure
    if parts.len() != 3
        || parts[0] != TOPIC_ROOT
        || parts[2] != "location"
        || parts[1].is_empty()
    {
        return Err(TrackerError::InvalidTopic(topic.to_string()));
    }

    let mut report: LocationReport = serde_json::from_slice(payload)?;
    if let Some(claimed) = report.vehicle_id.as_deref() {
        if claimed != parts[1] {
            debug!(
                "Payload vehicle id {} differs from topic, using {}",
                claimed, parts[1]
            );
        }
    }
    report.vehicle_id = Some(parts[1].to_string());
    Ok(report)
}

impl MqttClient {
    /// Receive next report
    pub async fn recv(&mut self) -> Option<Result<LocationReport, TrackerError>> {
        self.rx.recv().await
    }

    /// Publisher that shares this client's connection.
    pub fn publisher(&self, topic_prefix: &str) -> MqttPublisher {
        MqttPublisher {
            client: self.client.clone(),
            prefix: topic_prefix.trim_matches('/').to_string(),
        }
    }
}

/// Republishes events to `{prefix}/{channel}` at QoS 0, not retained.
pub struct MqttPublisher {
    client: AsyncClient,
    prefix: String,
}

impl MqttPublisher {
    pub fn topic(&self, channel: &Channel) -> String {
        format!("{}/{}", self.prefix, channel.name())
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, channel: &Channel, event: &BroadcastEvent) -> Result<(), TrackerError> {
        let payload = serde_json::to_vec(event)?;
        // try_publish never waits on a full request queue
        self.client
            .try_publish(self.topic(channel), QoS::AtMostOnce, false, payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::models::{UserId, VehicleId};

    #[test]
    fn parse_location_message() {
        let topic = "vehicles/V1/location";
        let payload = r#"{
            "latitude":37.5665,
            "longitude":126.978,
            "speed":30.5,
            "heading":90,
            "timestamp":"2024-03-01T09:15:00Z",
            "batteryLevel":81.5,
            "isCharging":false
        }"#
        .as_bytes();

        let report = parse_message(topic, payload).unwrap();

        let expected = LocationReport {
            vehicle_id: Some("V1".to_string()),
            latitude: Some(37.5665),
            longitude: Some(126.978),
            speed: Some(30.5),
            heading: Some(90.0),
            timestamp: Some(
                DateTime::parse_from_rfc3339("2024-03-01T09:15:00Z")
                    .unwrap()
                    .into(),
            ),
            battery_level: Some(81.5),
            is_charging: Some(false),
            ..LocationReport::default()
        };

        assert_eq!(report, expected);
    }

    #[test]
    fn topic_vehicle_id_wins_over_payload() {
        let payload = br#"{"vehicleId":"V2","latitude":1.0,"longitude":2.0}"#;
        let report = parse_message("vehicles/V1/location", payload).unwrap();
        assert_eq!(report.vehicle_id.as_deref(), Some("V1"));
    }

    #[test]
    fn missing_coordinates_still_parse() {
        let report = parse_message("vehicles/V1/location", b"{}").unwrap();
        assert!(report.validate(chrono::Utc::now()).is_err());
    }

    #[test]
    fn rejects_unknown_topics() {
        for topic in [
            "vehicles/V1",
            "vehicles//location",
            "vehicles/V1/status",
            "vehicles/V1/location/extra",
        ] {
            assert!(matches!(
                parse_message(topic, b"{}"),
                Err(TrackerError::InvalidTopic(_))
            ));
        }
    }

    #[test]
    fn report_filters() {
        assert!(is_report_filter("vehicles/+/location"));
        assert!(is_report_filter("vehicles/V1/location"));
        for filter in ["fleet/+/location", "vehicles/#", "vehicles/#/location", "+/+/location"] {
            assert!(!is_report_filter(filter), "{filter} accepted");
        }
    }

    #[test]
    fn rejects_malformed_payload() {
        assert!(matches!(
            parse_message("vehicles/V1/location", b"not json"),
            Err(TrackerError::Serde(_))
        ));
    }

    #[test]
    fn publisher_topics() {
        let (client, _event_loop) =
            AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10);
        let publisher = MqttPublisher {
            client,
            prefix: "tracking".to_string(),
        };

        assert_eq!(publisher.topic(&Channel::Global), "tracking/global");
        assert_eq!(
            publisher.topic(&Channel::Vehicle(VehicleId::try_from("V1").unwrap())),
            "tracking/vehicle/V1"
        );
        assert_eq!(
            publisher.topic(&Channel::User(UserId::new("U1"))),
            "tracking/user/U1"
        );
    }
}

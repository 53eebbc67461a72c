use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use platewatch_common::config::MqttRecorderConfig;
use platewatch_common::geometry::{BoundingRect, Coordinate};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::RecorderError;
use crate::detect::{Detection, PlateCandidate};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const CHANNEL_CAPACITY: usize = 32;

/// Publishes each plate read as JSON to `<base_topic>/<source>`.
///
/// Messages are handed to the client without waiting: while the broker is
/// unreachable the request queue fills up and further reads fail instead of
/// holding up the other recorders.
pub struct MqttRecorder {
    config: MqttRecorderConfig,
    /// Sources whose discovery configs have been published. Replayed on
    /// every reconnect.
    announced: Arc<Mutex<BTreeSet<String>>>,
    session: Mutex<Option<Session>>,
}

struct Session {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

/// Message body for one plate read.
#[derive(Debug, Serialize)]
pub struct PlatePayload<'a> {
    pub source: &'a str,
    pub epoch_time: i64,
    pub plate: &'a str,
    pub confidence: f64,
    pub roi: BoundingRect,
    pub coordinates: &'a [Coordinate],
}

impl<'a> PlatePayload<'a> {
    pub fn new(source: &'a str, epoch_time: i64, candidate: &'a PlateCandidate) -> Self {
        Self {
            source,
            epoch_time,
            plate: &candidate.plate,
            confidence: candidate.confidence,
            roi: candidate.roi,
            coordinates: &candidate.coordinates,
        }
    }
}

// -- Home Assistant discovery --------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HassDevice {
    pub identifiers: Vec<String>,
    pub name: String,
    pub model: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HassSensorConfig {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    pub json_attributes_topic: String,
    pub value_template: &'static str,
    pub icon: &'static str,
    pub device: HassDevice,
}

#[derive(Debug, Serialize)]
pub struct HassCameraConfig {
    pub name: String,
    pub unique_id: String,
    pub topic: String,
    pub device: HassDevice,
}

/// Retained discovery configs for one source, as `(topic, payload)` pairs.
pub fn discovery_messages(
    config: &MqttRecorderConfig,
    source: &str,
) -> Result<Vec<(String, Vec<u8>)>, RecorderError> {
    let prefix = config.hass_discovery.prefix.trim_end_matches('/');
    let node = object_id(&config.client_id);
    let object = object_id(source);
    let device = HassDevice {
        identifiers: vec![format!("{node}_{object}")],
        name: format!("platewatch {source}"),
        model: "platewatch",
    };

    let sensor = HassSensorConfig {
        name: format!("{source} plate"),
        unique_id: format!("{node}_{object}_plate"),
        state_topic: plate_topic(&config.base_topic, source),
        json_attributes_topic: plate_topic(&config.base_topic, source),
        value_template: "{{ value_json.plate }}",
        icon: "mdi:car",
        device: device.clone(),
    };
    let mut messages = vec![(
        format!("{prefix}/sensor/{node}/{object}_plate/config"),
        serde_json::to_vec(&sensor).map_err(|e| RecorderError::Encode(e.to_string()))?,
    )];

    if config.publish_image {
        let camera = HassCameraConfig {
            name: format!("{source} plate image"),
            unique_id: format!("{node}_{object}_image"),
            topic: image_topic(&config.base_topic, source),
            device,
        };
        messages.push((
            format!("{prefix}/camera/{node}/{object}_image/config"),
            serde_json::to_vec(&camera).map_err(|e| RecorderError::Encode(e.to_string()))?,
        ));
    }
    Ok(messages)
}

fn publish_discovery(client: &AsyncClient, config: &MqttRecorderConfig, source: &str) -> Result<(), RecorderError> {
    for (topic, payload) in discovery_messages(config, source)? {
        client.try_publish(topic, QoS::AtLeastOnce, true, payload)?;
    }
    Ok(())
}

/// Home Assistant ids allow `[A-Za-z0-9_-]` only.
fn object_id(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

fn plate_topic(base_topic: &str, source: &str) -> String {
    format!("{}/{}", base_topic.trim_end_matches('/'), source)
}

fn image_topic(base_topic: &str, source: &str) -> String {
    format!("{}/image", plate_topic(base_topic, source))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MqttRecorder {
    pub fn new(config: &MqttRecorderConfig) -> Self {
        Self {
            config: config.clone(),
            announced: Arc::new(Mutex::new(BTreeSet::new())),
            session: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn topic(&self, source: &str) -> String {
        plate_topic(&self.config.base_topic, source)
    }

    pub fn image_topic(&self, source: &str) -> String {
        image_topic(&self.config.base_topic, source)
    }

    /// Sources announced to Home Assistant so far.
    pub fn announced(&self) -> Vec<String> {
        lock(&self.announced).iter().cloned().collect()
    }

    /// Create the client and drive its event loop in the background. The
    /// loop reconnects on its own; connection errors are logged, not fatal.
    pub fn connect(&self) {
        let mut options = MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let Some(user) = &self.config.username {
            options.set_credentials(user, self.config.password.clone().unwrap_or_default());
        }

        let (client, mut event_loop) = AsyncClient::new(options, CHANNEL_CAPACITY);
        let config = self.config.clone();
        let announced = Arc::clone(&self.announced);
        let discovery_client = client.clone();

        let handle = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(recorder = %config.name, host = %config.host, port = config.port, "connected to MQTT broker");
                        if config.hass_discovery.enable {
                            let sources: Vec<String> = lock(&announced).iter().cloned().collect();
                            for source in sources {
                                if let Err(e) = publish_discovery(&discovery_client, &config, &source) {
                                    warn!(recorder = %config.name, source = %source, error = %e, "failed to republish discovery config");
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        info!(recorder = %config.name, "MQTT broker closed the session");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(recorder = %config.name, error = %e, "MQTT connection error, retrying in {:?}", RECONNECT_DELAY);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        *lock(&self.session) = Some(Session {
            client,
            event_loop: handle,
        });
    }

    pub async fn disconnect(&self) {
        let session = lock(&self.session).take();
        if let Some(session) = session {
            if let Err(e) = session.client.disconnect().await {
                debug!(recorder = %self.config.name, error = %e, "MQTT disconnect failed");
            }
            session.event_loop.abort();
        }
    }

    /// Queue one message per candidate, plus the image when enabled. Fails
    /// with [`RecorderError::Mqtt`] when the client's queue is full.
    pub fn publish(&self, detection: &Detection, source: &str, jpeg: &[u8]) -> Result<(), RecorderError> {
        let client = lock(&self.session)
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or(RecorderError::Closed)?;

        if self.config.hass_discovery.enable {
            self.announce(&client, source);
        }

        let topic = self.topic(source);
        for candidate in &detection.candidates {
            let payload = serde_json::to_vec(&PlatePayload::new(source, detection.epoch_time, candidate))
                .map_err(|e| RecorderError::Encode(e.to_string()))?;
            client.try_publish(topic.as_str(), QoS::AtLeastOnce, false, payload)?;
        }
        if self.config.publish_image && !jpeg.is_empty() {
            client.try_publish(self.image_topic(source), QoS::AtLeastOnce, false, jpeg.to_vec())?;
        }
        debug!(recorder = %self.config.name, topic = %topic, candidates = detection.candidates.len(), "queued MQTT messages");
        Ok(())
    }

    /// Publish discovery configs the first time `source` is seen.
    fn announce(&self, client: &AsyncClient, source: &str) {
        if !lock(&self.announced).insert(source.to_string()) {
            return;
        }
        match publish_discovery(client, &self.config, source) {
            Ok(()) => info!(recorder = %self.config.name, source, "published Home Assistant discovery config"),
            Err(e) => {
                warn!(recorder = %self.config.name, source, error = %e, "failed to publish discovery config");
                lock(&self.announced).remove(source);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use platewatch_common::config::HassDiscoveryConfig;
    use serde_json::{json, Value};

    fn config(base_topic: &str) -> MqttRecorderConfig {
        MqttRecorderConfig {
            name: "mqtt".into(),
            host: "127.0.0.1".into(),
            port: 1,
            base_topic: base_topic.into(),
            client_id: "test".into(),
            username: None,
            password: None,
            publish_image: true,
            hass_discovery: HassDiscoveryConfig::default(),
        }
    }

    fn detection() -> Detection {
        Detection {
            epoch_time: 1,
            candidates: vec![PlateCandidate {
                plate: "Q".into(),
                confidence: 1.0,
                coordinates: vec![Coordinate::new(0, 0)],
                roi: BoundingRect::default(),
                jpeg: Bytes::new(),
            }],
        }
    }

    #[test]
    fn topics_hang_off_the_base() {
        let recorder = MqttRecorder::new(&config("platewatch/"));
        assert_eq!(recorder.topic("driveway"), "platewatch/driveway");
        assert_eq!(recorder.image_topic("driveway"), "platewatch/driveway/image");
    }

    #[test]
    fn payload_shape() {
        let candidate = PlateCandidate {
            plate: "ABC123".into(),
            confidence: 91.5,
            coordinates: vec![Coordinate::new(1, 2), Coordinate::new(3, 4)],
            roi: BoundingRect::new(1, 2, 2, 2),
            jpeg: Bytes::new(),
        };
        let json = serde_json::to_value(PlatePayload::new("gate", 42, &candidate)).unwrap();
        assert_eq!(
            json,
            json!({
                "source": "gate",
                "epoch_time": 42,
                "plate": "ABC123",
                "confidence": 91.5,
                "roi": {"left": 1, "top": 2, "width": 2, "height": 2},
                "coordinates": [{"x": 1, "y": 2}, {"x": 3, "y": 4}]
            })
        );
    }

    #[test]
    fn discovery_configs_point_at_the_plate_topics() {
        let mut config = config("platewatch");
        config.client_id = "plate watch".into();
        config.hass_discovery = HassDiscoveryConfig {
            enable: true,
            prefix: "homeassistant/".into(),
        };

        let messages = discovery_messages(&config, "front gate").unwrap();
        let topics: Vec<&str> = messages.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(
            topics,
            [
                "homeassistant/sensor/plate_watch/front_gate_plate/config",
                "homeassistant/camera/plate_watch/front_gate_image/config",
            ]
        );

        let sensor: Value = serde_json::from_slice(&messages[0].1).unwrap();
        assert_eq!(
            sensor,
            json!({
                "name": "front gate plate",
                "unique_id": "plate_watch_front_gate_plate",
                "state_topic": "platewatch/front gate",
                "json_attributes_topic": "platewatch/front gate",
                "value_template": "{{ value_json.plate }}",
                "icon": "mdi:car",
                "device": {
                    "identifiers": ["plate_watch_front_gate"],
                    "name": "platewatch front gate",
                    "model": "platewatch"
                }
            })
        );
        let camera: Value = serde_json::from_slice(&messages[1].1).unwrap();
        assert_eq!(camera["topic"], "platewatch/front gate/image");

        config.publish_image = false;
        assert_eq!(discovery_messages(&config, "gate").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn publish_before_connect_is_closed() {
        let recorder = MqttRecorder::new(&config("platewatch"));
        let err = recorder.publish(&detection(), "cam", b"").unwrap_err();
        assert!(matches!(err, RecorderError::Closed));
    }

    #[tokio::test]
    async fn sources_are_announced_once() {
        let mut config = config("platewatch");
        config.publish_image = false;
        config.hass_discovery.enable = true;
        let recorder = MqttRecorder::new(&config);
        recorder.connect();

        recorder.publish(&detection(), "gate", b"").unwrap();
        recorder.publish(&detection(), "gate", b"").unwrap();
        recorder.publish(&detection(), "drive", b"").unwrap();
        assert_eq!(recorder.announced(), ["drive", "gate"]);
        recorder.disconnect().await;
    }

    #[tokio::test]
    async fn unreachable_broker_fails_fast_once_the_queue_is_full() {
        let recorder = MqttRecorder::new(&config("platewatch"));
        recorder.connect();

        // The request queue holds CHANNEL_CAPACITY messages; every publish
        // here queues two (plate and image).
        let outcomes: Vec<bool> = (0..CHANNEL_CAPACITY)
            .map(|_| recorder.publish(&detection(), "cam", b"jpeg").is_ok())
            .collect();
        assert!(outcomes[0]);
        assert!(outcomes.iter().any(|ok| !ok), "queue never filled");
        assert!(matches!(
            recorder.publish(&detection(), "cam", b"jpeg"),
            Err(RecorderError::Mqtt(_))
        ));

        recorder.disconnect().await;
        assert!(recorder.publish(&detection(), "cam", b"").is_err());
    }
}

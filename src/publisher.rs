use crate::config::Config;
use crate::debouncer::{Alert, Sample};
use crate::image_processing::{encode_gif, encode_jpeg, FrameBuffer, FrameRing};
use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, QoS};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::{self, JoinHandle};
use tokio::time::{self, Duration};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DetectionEvent {
    pub event_id: String,
    pub camera_id: u32,
    pub device_id: String,
    pub location: String,
    pub detected_objects: Vec<String>,
    pub confidence: f32,
    pub timestamp: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub topic: String,
    pub data: NotificationData,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    #[serde(rename = "type")]
    pub kind: String,
    pub camera_id: String,
    pub location: String,
    pub event_id: String,
    pub timestamp: String,
}

#[derive(Debug, Copy, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeviceStatus {
    pub device_id: String,
    pub name: String,
    pub location: String,
    pub status: DeviceState,
    pub detection_count: u64,
    pub timestamp: String,
}

/// Who is reporting, and where the reports go.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub camera_id: u32,
    pub device_id: String,
    pub location: String,
    topic_prefix: String,
}

impl DeviceIdentity {
    pub fn new(camera_id: u32, device_id: &str, location: &str, topic_prefix: &str) -> Self {
        DeviceIdentity {
            camera_id,
            device_id: device_id.to_string(),
            location: location.to_string(),
            topic_prefix: topic_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn events_topic(&self) -> String {
        format!("{}/events", self.topic_prefix)
    }

    pub fn notifications_topic(&self) -> String {
        format!("{}/notifications", self.topic_prefix)
    }

    pub fn device_topic(&self) -> String {
        format!("{}/devices/{}", self.topic_prefix, self.device_id)
    }

    pub fn event(
        &self,
        alert: &Alert,
        sample: &Sample,
        image: Option<&[u8]>,
        now: DateTime<Utc>,
    ) -> DetectionEvent {
        let mut detected_objects: Vec<String> = sample
            .classes()
            .map(|class| class.name().to_lowercase())
            .collect();
        if detected_objects.is_empty() {
            detected_objects.push(alert.class.name().to_lowercase());
        }

        DetectionEvent {
            event_id: format!("{}-{}", self.device_id, now.format("%Y%m%d%H%M%S%3f")),
            camera_id: self.camera_id,
            device_id: self.device_id.clone(),
            location: self.location.clone(),
            detected_objects,
            confidence: alert.confidence,
            timestamp: now.to_rfc3339(),
            status: "pending".to_string(),
            image: image.map(base64::encode),
        }
    }

    pub fn notification(&self, event: &DetectionEvent) -> Notification {
        let place = if self.location.is_empty() {
            format!("camera {}", self.camera_id)
        } else {
            self.location.clone()
        };

        Notification {
            title: "Smoking detected".to_string(),
            body: format!("Smoking was detected at {}.", place),
            topic: "smoking_detection".to_string(),
            data: NotificationData {
                kind: "smoking_detection".to_string(),
                camera_id: event.camera_id.to_string(),
                location: event.location.clone(),
                event_id: event.event_id.clone(),
                timestamp: event.timestamp.clone(),
            },
        }
    }

    pub fn status(&self, state: DeviceState, detection_count: u64, now: DateTime<Utc>) -> DeviceStatus {
        DeviceStatus {
            device_id: self.device_id.clone(),
            name: format!("CCTV Camera {}", self.camera_id),
            location: self.location.clone(),
            status: state,
            detection_count,
            timestamp: now.to_rfc3339(),
        }
    }
}

pub fn snapshot_name(now: DateTime<Local>) -> String {
    format!("smoking_snapshot_{}.jpg", now.format("%Y%m%d_%H%M%S"))
}

pub fn clip_name(now: DateTime<Local>) -> String {
    format!("smoking_video_{}.gif", now.format("%Y%m%d_%H%M%S"))
}

#[derive(Clone)]
enum Transport {
    Mqtt(AsyncClient),
    /// Payloads are only logged.
    DryRun,
}

impl Transport {
    async fn send(&self, topic: String, payload: Vec<u8>, retain: bool) {
        match self {
            Transport::Mqtt(client) => {
                if let Err(err) = client
                    .publish(topic.as_str(), QoS::AtLeastOnce, retain, payload)
                    .await
                {
                    log::warn!("failed to publish to {}: {}", topic, err);
                }
            }
            Transport::DryRun => {
                log::info!("[dry-run] {} ({} bytes)", topic, payload.len());
            }
        }
    }
}

/// Forwards smoking events, push notifications and device status.
pub struct Publisher {
    transport: Transport,
    identity: DeviceIdentity,
    send_notification: bool,
    attach_image: bool,
    snapshot_dir: Option<PathBuf>,
    jpeg_quality: u8,
    detection_count: Arc<AtomicU64>,
    event_loop: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Publisher {
    pub fn connect(config: &Config) -> Self {
        let identity = identity(config);

        let mut mqttoptions =
            MqttOptions::new(&config.mqtt_client_id, &config.mqtt_host, config.mqtt_port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if let (Some(username), Some(password)) = (&config.mqtt_username, &config.mqtt_password) {
            mqttoptions.set_credentials(username, password);
        }
        let will = identity.status(DeviceState::Offline, 0, Utc::now());
        if let Ok(payload) = serde_json::to_vec(&will) {
            mqttoptions.set_last_will(LastWill::new(
                identity.device_topic(),
                payload,
                QoS::AtLeastOnce,
                true,
            ));
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 10);
        let event_loop = task::spawn(drive(eventloop));
        log::info!(
            "publishing to mqtt://{}:{}/{}",
            config.mqtt_host,
            config.mqtt_port,
            config.topic_prefix
        );

        Self::with_transport(Transport::Mqtt(client), identity, config, Some(event_loop))
    }

    pub fn dry_run(config: &Config) -> Self {
        Self::with_transport(Transport::DryRun, identity(config), config, None)
    }

    fn with_transport(
        transport: Transport,
        identity: DeviceIdentity,
        config: &Config,
        event_loop: Option<JoinHandle<()>>,
    ) -> Self {
        Publisher {
            transport,
            identity,
            send_notification: config.send_notification,
            attach_image: config.attach_image,
            snapshot_dir: config.snapshot_dir.clone(),
            jpeg_quality: config.jpeg_quality,
            detection_count: Arc::new(AtomicU64::new(0)),
            event_loop,
            heartbeat: None,
        }
    }

    pub fn detection_count(&self) -> u64 {
        self.detection_count.load(Ordering::Relaxed)
    }

    /// Announces the device and keeps refreshing its status.
    pub async fn register(&mut self, heartbeat_interval: Duration) -> Result<()> {
        self.send_status(DeviceState::Online).await?;

        let transport = self.transport.clone();
        let identity = self.identity.clone();
        let count = self.detection_count.clone();
        self.heartbeat = Some(task::spawn(async move {
            let mut interval = time::interval(heartbeat_interval);
            // the first tick completes immediately and registration already covered it
            interval.tick().await;
            loop {
                interval.tick().await;
                let detections = count.load(Ordering::Relaxed);
                let status = identity.status(DeviceState::Online, detections, Utc::now());
                match serde_json::to_vec(&status) {
                    Ok(payload) => {
                        transport.send(identity.device_topic(), payload, true).await;
                        log::debug!("heartbeat sent ({} detections)", detections);
                    }
                    Err(err) => log::warn!("could not encode heartbeat: {}", err),
                }
            }
        }));
        Ok(())
    }

    /// Encodes the frame, stores the optional snapshot and pre-event clip, and
    /// queues the event (and notification) for delivery. Returns the event id.
    ///
    /// Encoding and disk writes block; call from a blocking context.
    pub fn report(
        &self,
        alert: &Alert,
        sample: &Sample,
        frame: &FrameBuffer,
        clip: &FrameRing,
        fps: f32,
    ) -> Result<String> {
        let jpeg = if self.attach_image || self.snapshot_dir.is_some() {
            Some(encode_jpeg(frame, self.jpeg_quality).context("failed to encode snapshot")?)
        } else {
            None
        };

        if let Some(dir) = &self.snapshot_dir {
            let stamp = Local::now();
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;

            if let Some(jpeg) = &jpeg {
                let path = dir.join(snapshot_name(stamp));
                std::fs::write(&path, jpeg)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                log::info!("snapshot saved to {}", path.display());
            }

            if !clip.is_empty() {
                let gif = encode_gif(clip.iter(), fps).context("failed to encode clip")?;
                let path = dir.join(clip_name(stamp));
                std::fs::write(&path, gif)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                log::info!("{} frame clip saved to {}", clip.len(), path.display());
            }
        }

        let image = if self.attach_image { jpeg.as_deref() } else { None };
        let event = self.identity.event(alert, sample, image, Utc::now());
        let event_id = event.event_id.clone();
        let payload = serde_json::to_vec(&event)?;
        let notification = if self.send_notification {
            Some(serde_json::to_vec(&self.identity.notification(&event))?)
        } else {
            None
        };

        let transport = self.transport.clone();
        let events_topic = self.identity.events_topic();
        let notifications_topic = self.identity.notifications_topic();
        task::spawn(async move {
            transport.send(events_topic, payload, false).await;
            if let Some(notification) = notification {
                transport.send(notifications_topic, notification, false).await;
            }
        });

        self.detection_count.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "event {} queued: {} ({:.2})",
            event_id,
            event.detected_objects.join(", "),
            event.confidence
        );
        Ok(event_id)
    }

    /// Marks the device offline and flushes the connection.
    pub async fn shutdown(mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if let Err(err) = self.send_status(DeviceState::Offline).await {
            log::warn!("could not publish offline status: {:#}", err);
        }

        if let Transport::Mqtt(client) = &self.transport {
            if let Err(err) = client.disconnect().await {
                log::warn!("mqtt disconnect failed: {}", err);
            }
        }
        if let Some(event_loop) = self.event_loop.take() {
            if time::timeout(Duration::from_secs(2), event_loop).await.is_err() {
                log::warn!("mqtt connection did not close in time");
            }
        }
    }

    async fn send_status(&self, state: DeviceState) -> Result<()> {
        let status = self
            .identity
            .status(state, self.detection_count(), Utc::now());
        let payload = serde_json::to_vec(&status)?;
        self.transport
            .send(self.identity.device_topic(), payload, true)
            .await;
        Ok(())
    }
}

fn identity(config: &Config) -> DeviceIdentity {
    DeviceIdentity::new(
        config.camera_id,
        &config.device_id,
        &config.location,
        &config.topic_prefix,
    )
}

async fn drive(mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(Event::Incoming(incoming)) => log::trace!("mqtt incoming {:?}", incoming),
            Ok(Event::Outgoing(outgoing)) => log::trace!("mqtt outgoing {:?}", outgoing),
            Err(err) => {
                log::warn!("mqtt connection error: {}", err);
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debouncer::{AlertKind, Class};
    use chrono::TimeZone;
    use serde_json::json;
    use tokio::time::Instant;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new(1, "raspberry-pi-001", "Main entrance", "smoke_detection/")
    }

    fn warning() -> Alert {
        Alert {
            kind: AlertKind::Warning,
            class: Class::Cigarette,
            confidence: 0.5,
        }
    }

    fn at_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn topics_hang_off_the_prefix() {
        let identity = identity();
        assert_eq!(identity.events_topic(), "smoke_detection/events");
        assert_eq!(identity.notifications_topic(), "smoke_detection/notifications");
        assert_eq!(
            identity.device_topic(),
            "smoke_detection/devices/raspberry-pi-001"
        );
    }

    #[test]
    fn event_payload_shape() {
        let sample = Sample::new(Instant::now())
            .with(Class::Person, 0.9)
            .with(Class::Cigarette, 0.5);

        let event = identity().event(&warning(), &sample, Some(b"jpeg"), at_noon());

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "event_id": "raspberry-pi-001-20250301120000000",
                "camera_id": 1,
                "device_id": "raspberry-pi-001",
                "location": "Main entrance",
                "detected_objects": ["person", "cigarette"],
                "confidence": 0.5,
                "timestamp": "2025-03-01T12:00:00+00:00",
                "status": "pending",
                "image": "anBlZw==",
            })
        );
    }

    #[test]
    fn event_without_image_omits_the_field() {
        let sample = Sample::new(Instant::now());
        let event = identity().event(&warning(), &sample, None, at_noon());
        let value = serde_json::to_value(&event).unwrap();

        assert!(value.get("image").is_none());
        assert_eq!(value["detected_objects"], json!(["cigarette"]));
    }

    #[test]
    fn notification_payload_shape() {
        let identity = identity();
        let sample = Sample::new(Instant::now()).with(Class::Person, 0.9);
        let event = identity.event(&warning(), &sample, None, at_noon());

        let value = serde_json::to_value(identity.notification(&event)).unwrap();

        assert_eq!(value["title"], "Smoking detected");
        assert_eq!(value["body"], "Smoking was detected at Main entrance.");
        assert_eq!(value["data"]["type"], "smoking_detection");
        assert_eq!(value["data"]["cameraId"], "1");
        assert_eq!(value["data"]["eventId"], json!(event.event_id));
    }

    #[test]
    fn status_payload_shape() {
        let value =
            serde_json::to_value(identity().status(DeviceState::Offline, 3, at_noon())).unwrap();

        assert_eq!(value["status"], "offline");
        assert_eq!(value["name"], "CCTV Camera 1");
        assert_eq!(value["detection_count"], 3);
    }

    #[test]
    fn snapshot_names_are_timestamped() {
        let now = Local.with_ymd_and_hms(2025, 3, 1, 9, 5, 7).unwrap();
        assert_eq!(snapshot_name(now), "smoking_snapshot_20250301_090507.jpg");
        assert_eq!(clip_name(now), "smoking_video_20250301_090507.gif");
    }

    #[tokio::test]
    async fn dry_run_report_writes_snapshot_and_clip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_toml("onnx_model_file = \"model.onnx\"").unwrap();
        config.snapshot_dir = Some(dir.path().join("snapshots"));

        let publisher = Publisher::dry_run(&config);
        let sample = Sample::new(Instant::now()).with(Class::Person, 0.9);
        let frame = Arc::new(FrameBuffer::from_pixel(8, 8, image::Rgb([200, 10, 10])));
        let mut clip = FrameRing::new(4);
        clip.push(Arc::new(FrameBuffer::from_pixel(8, 8, image::Rgb([10, 200, 10]))));
        clip.push(frame.clone());

        let event_id = publisher
            .report(&warning(), &sample, &frame, &clip, 10.0)
            .expect("report");

        assert!(event_id.starts_with("raspberry-pi-001-"));
        assert_eq!(publisher.detection_count(), 1);
        let mut written: Vec<String> = std::fs::read_dir(dir.path().join("snapshots"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        written.sort();
        assert_eq!(written.len(), 2);
        assert!(written[0].starts_with("smoking_snapshot_") && written[0].ends_with(".jpg"));
        assert!(written[1].starts_with("smoking_video_") && written[1].ends_with(".gif"));

        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn empty_clip_writes_no_video() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_toml("onnx_model_file = \"model.onnx\"").unwrap();
        config.snapshot_dir = Some(dir.path().to_path_buf());

        let publisher = Publisher::dry_run(&config);
        let sample = Sample::new(Instant::now()).with(Class::Person, 0.9);
        let frame = FrameBuffer::from_pixel(8, 8, image::Rgb([200, 10, 10]));

        publisher
            .report(&warning(), &sample, &frame, &FrameRing::new(4), 10.0)
            .expect("report");

        let written = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(written, 1);

        publisher.shutdown().await;
    }
}

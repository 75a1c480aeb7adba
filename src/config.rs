use crate::debouncer::{DebounceSettings, Threshold};
use anyhow::{anyhow, bail, Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::time::Duration;

fn mqtt_host_default() -> String {
    "localhost".to_string()
}

fn mqtt_port_default() -> u16 {
    1883
}

fn mqtt_client_id_default() -> String {
    "smoke-detector".to_string()
}

fn topic_prefix_default() -> String {
    "smoke_detection".to_string()
}

fn camera_index_default() -> usize {
    0
}

fn camera_width_default() -> u32 {
    640
}

fn camera_height_default() -> u32 {
    480
}

fn camera_fps_default() -> u32 {
    30
}

fn max_capture_errors_default() -> u32 {
    30
}

fn input_size_default() -> u32 {
    640
}

fn confidence_threshold_default() -> f32 {
    0.4
}

fn nms_threshold_default() -> f32 {
    0.4
}

fn detection_window_default() -> f32 {
    10.0
}

fn required_duration_default() -> f32 {
    3.0
}

fn guide_cycle_default() -> f32 {
    15.0
}

fn warning_cycle_default() -> f32 {
    31.0
}

fn upload_interval_default() -> f32 {
    30.0
}

fn loop_interval_ms_default() -> u64 {
    100
}

fn guide_sound_default() -> PathBuf {
    PathBuf::from("person.mp3")
}

fn warning_sound_default() -> PathBuf {
    PathBuf::from("smoke.mp3")
}

fn audio_player_default() -> Vec<String> {
    vec!["mpg123".to_string(), "-q".to_string()]
}

fn camera_id_default() -> u32 {
    1
}

fn device_id_default() -> String {
    "raspberry-pi-001".to_string()
}

fn heartbeat_interval_default() -> u64 {
    60
}

fn jpeg_quality_default() -> u8 {
    85
}

fn clip_frames_default() -> usize {
    150
}

fn true_default() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "mqtt_host_default")]
    pub mqtt_host: String,
    #[serde(default = "mqtt_port_default")]
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    #[serde(default = "mqtt_client_id_default")]
    pub mqtt_client_id: String,
    /// events, notifications and device status are published below this prefix
    #[serde(default = "topic_prefix_default")]
    pub topic_prefix: String,
    #[serde(default = "camera_index_default")]
    pub camera_index: usize,
    #[serde(default = "camera_width_default")]
    pub camera_width: u32,
    #[serde(default = "camera_height_default")]
    pub camera_height: u32,
    #[serde(default = "camera_fps_default")]
    pub camera_fps: u32,
    #[serde(default = "max_capture_errors_default")]
    pub max_capture_errors: u32,
    /// must be absolute path to file
    pub onnx_model_file: PathBuf,
    #[serde(default = "input_size_default")]
    pub input_width: u32,
    #[serde(default = "input_size_default")]
    pub input_height: u32,
    #[serde(default = "confidence_threshold_default")]
    pub confidence_threshold: f32,
    #[serde(default = "nms_threshold_default")]
    pub nms_threshold: f32,
    /// seconds of history kept per class
    #[serde(default = "detection_window_default")]
    pub detection_window: f32,
    /// seconds a class must be present inside the window
    #[serde(default = "required_duration_default")]
    pub required_duration: f32,
    /// fixed sample count, takes precedence over `required_duration`
    pub required_samples: Option<usize>,
    #[serde(default = "guide_cycle_default")]
    pub guide_cycle: f32,
    #[serde(default = "warning_cycle_default")]
    pub warning_cycle: f32,
    #[serde(default = "upload_interval_default")]
    pub upload_interval: f32,
    #[serde(default)]
    pub warning_resets_guide: bool,
    #[serde(default = "loop_interval_ms_default")]
    pub loop_interval_ms: u64,
    #[serde(default = "guide_sound_default")]
    pub guide_sound: PathBuf,
    #[serde(default = "warning_sound_default")]
    pub warning_sound: PathBuf,
    /// program and leading arguments; the sound file is appended
    #[serde(default = "audio_player_default")]
    pub audio_player: Vec<String>,
    #[serde(default = "camera_id_default")]
    pub camera_id: u32,
    #[serde(default = "device_id_default")]
    pub device_id: String,
    #[serde(default)]
    pub location: String,
    #[serde(default = "heartbeat_interval_default")]
    pub heartbeat_interval: u64,
    #[serde(default = "true_default")]
    pub send_notification: bool,
    #[serde(default = "true_default")]
    pub attach_image: bool,
    pub snapshot_dir: Option<PathBuf>,
    #[serde(default = "jpeg_quality_default")]
    pub jpeg_quality: u8,
    /// frames before the event saved as a GIF next to the snapshot, 0 disables
    #[serde(default = "clip_frames_default")]
    pub clip_frames: usize,
}

impl Config {
    /// Loads `path`, or `config.toml` from the platform config directory.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_path()?,
        };

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_toml(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        log::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, secs) in [
            ("detection_window", self.detection_window),
            ("required_duration", self.required_duration),
            ("guide_cycle", self.guide_cycle),
            ("warning_cycle", self.warning_cycle),
            ("upload_interval", self.upload_interval),
        ] {
            if !secs.is_finite() || secs <= 0.0 {
                bail!("{} must be a positive number of seconds, got {}", name, secs);
            }
            if Duration::try_from_secs_f32(secs).is_err() {
                bail!("{} is too large, got {} seconds", name, secs);
            }
        }

        for (name, value) in [
            ("confidence_threshold", self.confidence_threshold),
            ("nms_threshold", self.nms_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                bail!("{} must be in (0, 1], got {}", name, value);
            }
        }

        if self.input_width == 0 || self.input_height == 0 {
            bail!("model input size must be non-zero");
        }
        if self.required_samples == Some(0) {
            bail!("required_samples must be at least 1");
        }
        if self.audio_player.is_empty() {
            bail!("audio_player needs at least a program name");
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            bail!("jpeg_quality must be in 1..=100");
        }
        Ok(())
    }

    pub fn debounce_settings(&self) -> DebounceSettings {
        let threshold = match self.required_samples {
            Some(samples) => Threshold::Samples(samples),
            None => Threshold::Duration(Duration::from_secs_f32(self.required_duration)),
        };

        DebounceSettings {
            window: Duration::from_secs_f32(self.detection_window),
            threshold,
            guide_cycle: Duration::from_secs_f32(self.guide_cycle),
            warning_cycle: Duration::from_secs_f32(self.warning_cycle),
            upload_interval: Duration::from_secs_f32(self.upload_interval),
            warning_resets_guide: self.warning_resets_guide,
        }
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval.max(1))
    }
}

pub fn default_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "smoke-detector")
        .ok_or_else(|| anyhow!("could not determine a config directory"))?;
    Ok(dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::from_toml(r#"onnx_model_file = "/opt/models/final_detection640.onnx""#)
            .expect("minimal config");

        assert_eq!(config.mqtt_host, "localhost");
        assert_eq!(config.mqtt_port, 1883);
        assert_eq!(config.input_width, 640);
        assert_eq!(config.confidence_threshold, 0.4);
        assert_eq!(config.guide_sound, PathBuf::from("person.mp3"));
        assert_eq!(config.audio_player, vec!["mpg123", "-q"]);
        assert!(!config.warning_resets_guide);
        assert!(config.send_notification);
        assert!(config.snapshot_dir.is_none());
        assert_eq!(config.clip_frames, 150);

        let settings = config.debounce_settings();
        assert_eq!(settings.window, Duration::from_secs(10));
        assert_eq!(settings.threshold, Threshold::Duration(Duration::from_secs(3)));
        assert_eq!(settings.guide_cycle, Duration::from_secs(15));
        assert_eq!(settings.warning_cycle, Duration::from_secs(31));
        assert_eq!(settings.upload_interval, Duration::from_secs(30));
    }

    #[test]
    fn example_config_parses() {
        let config = Config::from_toml(include_str!("../config.example.toml")).unwrap();
        assert_eq!(config.location, "Main entrance");
        assert_eq!(config.loop_interval(), Duration::from_millis(100));
    }

    #[test]
    fn model_file_is_required() {
        assert!(Config::from_toml("mqtt_host = \"broker\"").is_err());
    }

    #[test]
    fn required_samples_overrides_duration() {
        let config = Config::from_toml(
            r#"
            onnx_model_file = "model.onnx"
            required_samples = 3
            warning_resets_guide = true
            "#,
        )
        .unwrap();

        let settings = config.debounce_settings();
        assert_eq!(settings.threshold, Threshold::Samples(3));
        assert!(settings.warning_resets_guide);
    }

    #[test]
    fn rejects_bad_values() {
        for bad in [
            "detection_window = 0",
            "detection_window = 1e30",
            "upload_interval = 1e30",
            "guide_cycle = -1.0",
            "confidence_threshold = 1.5",
            "nms_threshold = 0.0",
            "input_width = 0",
            "required_samples = 0",
            "audio_player = []",
            "jpeg_quality = 0",
        ] {
            let raw = format!("onnx_model_file = \"model.onnx\"\n{}", bad);
            assert!(Config::from_toml(&raw).is_err(), "accepted {}", bad);
        }
    }

    #[test]
    fn loads_from_file() {
        let mut file = NamedTempFile::new().expect("temp config");
        write!(
            file,
            r#"
            onnx_model_file = "/models/final_detection416.onnx"
            input_width = 416
            input_height = 416
            camera_id = 7
            location = "Main entrance"
            snapshot_dir = "/var/lib/smoke-detector"
            "#
        )
        .expect("write config");

        let config = Config::load(Some(file.path())).expect("load config");
        assert_eq!(config.input_width, 416);
        assert_eq!(config.camera_id, 7);
        assert_eq!(config.location, "Main entrance");
        assert_eq!(
            config.snapshot_dir,
            Some(PathBuf::from("/var/lib/smoke-detector"))
        );
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(dir.path().join("absent.toml").as_path())).unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }
}

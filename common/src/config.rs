use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::geometry::Coordinate;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
    #[serde(default)]
    pub recorders: Vec<RecorderConfig>,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionConfig {
    pub url: String,
    #[serde(default = "default_country_code")]
    pub country_code: String,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default = "default_recognition_timeout")]
    pub timeout_secs: u64,
}

// -- Sources ------------------------------------------------------------------

/// One camera feed. The `type` key selects the reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    Mjpeg(MjpegSourceConfig),
    Rtsp(RtspSourceConfig),
    File(FileSourceConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MjpegSourceConfig {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtspSourceConfig {
    pub name: String,
    pub url: String,
    /// Seconds between captured frames.
    #[serde(default = "default_capture_interval")]
    pub capture_interval: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSourceConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_capture_interval")]
    pub capture_interval: f64,
}

impl SourceConfig {
    pub fn name(&self) -> &str {
        match self {
            SourceConfig::Mjpeg(c) => &c.name,
            SourceConfig::Rtsp(c) => &c.name,
            SourceConfig::File(c) => &c.name,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            SourceConfig::Mjpeg(c) => check_http_url(&c.url, &c.name),
            SourceConfig::Rtsp(c) => {
                if !c.url.starts_with("rtsp://") && !c.url.starts_with("rtsps://") {
                    return Err(ConfigError::Invalid(format!(
                        "source {}: url must be an rtsp:// url",
                        c.name
                    )));
                }
                check_interval(c.capture_interval, &c.name)
            }
            SourceConfig::File(c) => check_interval(c.capture_interval, &c.name),
        }
    }
}

// -- Filters ------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FilterConfig {
    Motion(MotionFilterConfig),
    Mask(MaskFilterConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionFilterConfig {
    #[serde(default = "default_motion_name")]
    pub name: String,
    /// Write each passing frame to `<data_path>/debug/<name>.jpg`.
    #[serde(default)]
    pub debug: bool,
    /// Crop passing frames to the largest motion region.
    #[serde(default)]
    pub crop_to_roi: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskFilterConfig {
    #[serde(default = "default_mask_name")]
    pub name: String,
    /// Polygons as flat `"x1,y1,x2,y2,..."` lists, at least three points each.
    #[serde(default)]
    pub shapes: Vec<String>,
    #[serde(default)]
    pub debug: bool,
}

impl MaskFilterConfig {
    /// Parse `shapes` into polygons.
    pub fn polygons(&self) -> Result<Vec<Vec<Coordinate>>, ConfigError> {
        self.shapes
            .iter()
            .map(|shape| parse_shape(shape).map_err(|reason| {
                ConfigError::Invalid(format!("filter {}: shape {shape:?}: {reason}", self.name))
            }))
            .collect()
    }
}

fn parse_shape(shape: &str) -> Result<Vec<Coordinate>, String> {
    let values = shape
        .split(',')
        .map(|v| v.trim().parse::<i32>().map_err(|e| format!("{v:?}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    if values.len() % 2 != 0 {
        return Err("odd number of values".into());
    }
    if values.len() < 6 {
        return Err("a shape needs at least three points".into());
    }
    Ok(values
        .chunks_exact(2)
        .map(|xy| Coordinate::new(xy[0], xy[1]))
        .collect())
}

impl FilterConfig {
    pub fn name(&self) -> &str {
        match self {
            FilterConfig::Motion(c) => &c.name,
            FilterConfig::Mask(c) => &c.name,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            FilterConfig::Motion(_) => Ok(()),
            FilterConfig::Mask(c) => c.polygons().map(|_| ()),
        }
    }
}

// -- Recorders ----------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RecorderConfig {
    Sqlite(SqliteRecorderConfig),
    Mqtt(MqttRecorderConfig),
    File(FileRecorderConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteRecorderConfig {
    #[serde(default = "default_sqlite_name")]
    pub name: String,
    /// Database file. Relative paths resolve against `data_path`.
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,
    /// Store the filtered JPEG alongside each row.
    #[serde(default)]
    pub store_images: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttRecorderConfig {
    #[serde(default = "default_mqtt_name")]
    pub name: String,
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_mqtt_base_topic")]
    pub base_topic: String,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Also publish the JPEG to `<base_topic>/<source>/image`.
    #[serde(default)]
    pub publish_image: bool,
    #[serde(default)]
    pub hass_discovery: HassDiscoveryConfig,
}

/// Home Assistant MQTT discovery. When enabled, each source gets a retained
/// sensor config (and a camera config with `publish_image`) under `prefix`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HassDiscoveryConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_hass_discovery_prefix")]
    pub prefix: String,
}

impl Default for HassDiscoveryConfig {
    fn default() -> Self {
        Self {
            enable: false,
            prefix: default_hass_discovery_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecorderConfig {
    #[serde(default = "default_file_name")]
    pub name: String,
    /// Output path template. Tokens: `{{SOURCE}}`, `{{DATE}}`, `{{TIME}}`,
    /// `{{PLATE}}`, `{{CONFIDENCE}}`.
    #[serde(default = "default_file_pattern")]
    pub pattern: String,
    /// Files older than this are removed by the retention sweep. 0 keeps everything.
    #[serde(default = "default_retain_days")]
    pub retain_days: u32,
    /// Write the filtered frame instead of the original.
    #[serde(default)]
    pub use_filtered: bool,
}

impl RecorderConfig {
    pub fn name(&self) -> &str {
        match self {
            RecorderConfig::Sqlite(c) => &c.name,
            RecorderConfig::Mqtt(c) => &c.name,
            RecorderConfig::File(c) => &c.name,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            RecorderConfig::Mqtt(c) if c.host.trim().is_empty() => Err(ConfigError::Invalid(
                format!("recorder {}: mqtt host is empty", c.name),
            )),
            RecorderConfig::Mqtt(c) if c.hass_discovery.enable && c.hass_discovery.prefix.trim_matches('/').is_empty() => {
                Err(ConfigError::Invalid(format!(
                    "recorder {}: hass_discovery prefix is empty",
                    c.name
                )))
            }
            RecorderConfig::File(c) if c.pattern.trim().is_empty() => Err(ConfigError::Invalid(
                format!("recorder {}: file pattern is empty", c.name),
            )),
            _ => Ok(()),
        }
    }
}

// -- Ambient ------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_control_enable")]
    pub enable: bool,
    #[serde(default = "default_control_port")]
    pub port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enable: default_control_enable(),
            port: default_control_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject plugin arguments that would only fail once the pipeline runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_http_url(&self.recognition.url, "recognition")?;

        unique_names("source", self.sources.iter().map(SourceConfig::name))?;
        unique_names("filter", self.filters.iter().map(FilterConfig::name))?;
        unique_names("recorder", self.recorders.iter().map(RecorderConfig::name))?;

        for source in &self.sources {
            source.validate()?;
        }
        for filter in &self.filters {
            filter.validate()?;
        }
        for recorder in &self.recorders {
            recorder.validate()?;
        }
        Ok(())
    }
}

/// Validate a single plugin config submitted at runtime.
pub fn validate_source(config: &SourceConfig) -> Result<(), ConfigError> {
    config.validate()
}

pub fn validate_recorder(config: &RecorderConfig) -> Result<(), ConfigError> {
    config.validate()
}

fn unique_names<'a>(
    kind: &str,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("{kind} name is empty")));
        }
        if !seen.insert(name) {
            return Err(ConfigError::Invalid(format!("duplicate {kind} name {name:?}")));
        }
    }
    Ok(())
}

fn check_http_url(url: &str, owner: &str) -> Result<(), ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{owner}: url {url:?} must start with http:// or https://"
        )))
    }
}

fn check_interval(interval: f64, owner: &str) -> Result<(), ConfigError> {
    if interval.is_finite() && interval > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "source {owner}: capture_interval must be positive"
        )))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_data_path() -> PathBuf {
    PathBuf::from("./data")
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".into()
}
pub fn default_country_code() -> String {
    "us".into()
}
fn default_recognition_timeout() -> u64 {
    30
}
fn default_capture_interval() -> f64 {
    1.0
}
fn default_motion_name() -> String {
    "motion".into()
}
fn default_mask_name() -> String {
    "mask".into()
}
fn default_sqlite_name() -> String {
    "sqlite".into()
}
fn default_sqlite_path() -> PathBuf {
    PathBuf::from("platewatch.db")
}
fn default_mqtt_name() -> String {
    "mqtt".into()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_mqtt_base_topic() -> String {
    "platewatch".into()
}
fn default_mqtt_client_id() -> String {
    "platewatch".into()
}
fn default_hass_discovery_prefix() -> String {
    "homeassistant".into()
}
fn default_file_name() -> String {
    "file".into()
}
fn default_file_pattern() -> String {
    "./data/images/{{DATE}}/{{SOURCE}}/{{TIME}}_{{PLATE}}.jpeg".into()
}
fn default_retain_days() -> u32 {
    30
}
fn default_control_enable() -> bool {
    true
}
fn default_control_port() -> u16 {
    4000
}
fn default_log_level() -> String {
    "info".into()
}

use std::time::Duration;

use bytes::Bytes;
use platewatch_common::config::{default_country_code, RecognitionConfig};
use platewatch_common::frame::Frame;
use platewatch_common::geometry::{BoundingRect, Coordinate};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Client for the plate recognition HTTP service.
///
/// One multipart POST per frame: `upload` (the JPEG), `country_code` and,
/// when configured, `pattern`.
#[derive(Clone)]
pub struct DetectionClient {
    client: reqwest::Client,
    url: String,
    country_code: String,
    pattern: Option<String>,
}

/// One recognition call's result.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    /// Service timestamp for the whole call, in milliseconds.
    pub epoch_time: i64,
    pub candidates: Vec<PlateCandidate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlateCandidate {
    pub plate: String,
    pub confidence: f64,
    /// Plate polygon in the submitted frame's coordinates.
    pub coordinates: Vec<Coordinate>,
    pub roi: BoundingRect,
    /// The submitted frame's JPEG.
    #[serde(skip)]
    pub jpeg: Bytes,
}

impl Detection {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("recognition request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("recognition service returned {status}: {body}")]
    Service { status: u16, body: String },
    #[error("unreadable recognition response: {0}")]
    Decode(String),
}

#[derive(Deserialize)]
struct ServiceResponse {
    epoch_time: i64,
    #[serde(default)]
    results: Vec<ServiceResult>,
}

#[derive(Deserialize)]
struct ServiceResult {
    plate: String,
    confidence: f64,
    coordinates: Vec<Coordinate>,
}

impl DetectionClient {
    pub fn new(
        url: impl Into<String>,
        country_code: Option<String>,
        pattern: Option<String>,
        timeout: Duration,
    ) -> Result<Self, DetectError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            country_code: country_code.unwrap_or_else(default_country_code),
            pattern,
        })
    }

    pub fn from_config(config: &RecognitionConfig) -> Result<Self, DetectError> {
        Self::new(
            config.url.clone(),
            Some(config.country_code.clone()),
            config.pattern.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Submit `frame` and return every plate the service read.
    pub async fn detect(&self, frame: &Frame) -> Result<Detection, DetectError> {
        let upload = Part::bytes(frame.jpeg().to_vec())
            .file_name("frame.jpg")
            .mime_str("image/jpeg")?;
        let mut form = Form::new()
            .part("upload", upload)
            .text("country_code", self.country_code.clone());
        if let Some(pattern) = &self.pattern {
            form = form.text("pattern", pattern.clone());
        }

        let response = self.client.post(&self.url).multipart(form).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(DetectError::Service {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        let parsed: ServiceResponse =
            serde_json::from_slice(&body).map_err(|e| DetectError::Decode(e.to_string()))?;

        let candidates = parsed
            .results
            .into_iter()
            .map(|result| candidate(result, frame))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            epoch_time = parsed.epoch_time,
            candidates = candidates.len(),
            "recognition complete"
        );
        Ok(Detection {
            epoch_time: parsed.epoch_time,
            candidates,
        })
    }
}

fn candidate(result: ServiceResult, frame: &Frame) -> Result<PlateCandidate, DetectError> {
    if result.coordinates.is_empty() {
        return Err(DetectError::Decode(format!(
            "plate {} has no coordinates",
            result.plate
        )));
    }
    let roi = BoundingRect::from_points(&result.coordinates, frame.width(), frame.height());
    Ok(PlateCandidate {
        plate: result.plate,
        confidence: result.confidence,
        coordinates: result.coordinates,
        roi,
        jpeg: frame.jpeg().clone(),
    })
}

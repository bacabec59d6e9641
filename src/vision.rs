//! The recognition service boundary.
//!
//! We call Google Cloud Vision's `images:annotate` endpoint, one request
//! per page, and classify every failure exactly once, here, into a closed
//! taxonomy. Nothing downstream ever re-parses an error message.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{Engine as _, prelude::BASE64_STANDARD};
use serde::Deserialize;
use serde_json::json;

use crate::{prelude::*, render::Raster};

/// The Cloud Vision annotate endpoint.
const VISION_API_URL: &str = "https://vision.googleapis.com/v1/images:annotate";

/// Minimum gap between successive recognition requests, to stay well
/// within the service's rate limits.
pub const REQUEST_DELAY: Duration = Duration::from_millis(150);

/// Fixed backoff between retries of transient failures.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Cap on how long a single recognition call may take. Without this, a
/// hung service call would stall the whole run.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A point in image-pixel space. Vision omits zero-valued coordinates
/// from its JSON, so both fields default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct PixelPoint {
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
}

/// One recognized word with its bounding quad in image-pixel space.
///
/// Quad ordering is Vision's: point 0 is the top-left corner of the
/// word's bounding box and point 3 is the bottom-left. The composer
/// depends on this to compute word height and baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedWord {
    pub text: String,
    pub quad: Vec<PixelPoint>,
}

/// Everything that can go wrong talking to the recognition service.
///
/// The first three kinds will recur identically on every subsequent page,
/// so the pipeline fails fast on them. A [`RecognizeError::Transient`]
/// only degrades the affected page.
#[derive(Debug, thiserror::Error)]
pub enum RecognizeError {
    /// The Vision API is not activated for the caller's project.
    #[error(
        "the Cloud Vision API is not enabled for this project: {message}\n\
         Enable it in the Google Cloud console under APIs & Services, then retry."
    )]
    ServiceNotEnabled { message: String },

    /// The API key is malformed or was rejected outright.
    #[error(
        "the API key was rejected: {message}\n\
         Check the key under APIs & Services > Credentials."
    )]
    InvalidCredential { message: String },

    /// The API key is valid but scoped in a way that forbids this call.
    #[error(
        "the API key is restricted and cannot call the Vision API: {message}\n\
         Review the key's API and application restrictions."
    )]
    CredentialRestricted { message: String },

    /// Anything else: transport failures, timeouts, 5xx responses. The
    /// affected page keeps its image and simply gets no text layer.
    #[error("recognition service failure: {message}")]
    Transient { message: String },
}

impl RecognizeError {
    /// Will this error recur on every subsequent page?
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RecognizeError::Transient { .. })
    }
}

/// Interface to a word-level recognition service.
///
/// Takes `&mut self` because the pipeline is strictly sequential and the
/// real client tracks inter-request pacing state.
#[async_trait]
pub trait RecognitionService: Send {
    /// Recognize the words on one rasterized page.
    async fn recognize(
        &mut self,
        raster: &Raster,
    ) -> Result<Vec<RecognizedWord>, RecognizeError>;
}

/// [`RecognitionService`] backed by Google Cloud Vision.
pub struct VisionClient {
    http: reqwest::Client,
    api_key: String,
    language_hints: Vec<String>,
    max_retries: u32,
    /// When the previous *successful* request completed. Used to pace
    /// requests [`REQUEST_DELAY`] apart. `None` after failures and before
    /// the first request, so neither adds a delay.
    last_request: Option<Instant>,
}

impl VisionClient {
    /// Create a client. `max_retries` bounds how many times a transient
    /// failure is retried per page; 0 means no retry.
    pub fn new(
        api_key: String,
        language_hints: Vec<String>,
        max_retries: u32,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            api_key,
            language_hints,
            max_retries,
            last_request: None,
        })
    }

    /// Issue one annotate request and classify any failure.
    async fn annotate(&self, content: &str) -> Result<Vec<RecognizedWord>, RecognizeError> {
        let mut request = json!({
            "image": { "content": content },
            "features": [{ "type": "TEXT_DETECTION" }],
        });
        if !self.language_hints.is_empty() {
            request["imageContext"] = json!({ "languageHints": self.language_hints });
        }
        let body = json!({ "requests": [request] });

        let response = self
            .http
            .post(format!("{}?key={}", VISION_API_URL, self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|err| RecognizeError::Transient {
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let error = serde_json::from_str::<ApiErrorBody>(&text)
                .map(|body| body.error)
                .unwrap_or_else(|_| ApiError {
                    status: None,
                    message: format!("HTTP {status}: {text}"),
                    details: vec![],
                });
            return Err(classify_api_error(&error));
        }

        let annotate: AnnotateResponse =
            response
                .json()
                .await
                .map_err(|err| RecognizeError::Transient {
                    message: format!("failed to parse annotate response: {err}"),
                })?;
        let page = annotate
            .responses
            .into_iter()
            .next()
            .ok_or_else(|| RecognizeError::Transient {
                message: "annotate response contained no results".to_string(),
            })?;
        if let Some(error) = page.error {
            return Err(classify_api_error(&error));
        }
        Ok(words_from_annotations(page.text_annotations))
    }
}

#[async_trait]
impl RecognitionService for VisionClient {
    #[instrument(level = "debug", skip_all, fields(bytes = raster.data.len()))]
    async fn recognize(
        &mut self,
        raster: &Raster,
    ) -> Result<Vec<RecognizedWord>, RecognizeError> {
        // Pace ourselves relative to the previous successful request.
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < REQUEST_DELAY {
                tokio::time::sleep(REQUEST_DELAY - elapsed).await;
            }
        }

        // Encode the bitmap once, regardless of retries.
        let content = BASE64_STANDARD.encode(&raster.data);

        let mut attempt = 0;
        loop {
            match self.annotate(&content).await {
                Ok(words) => {
                    self.last_request = Some(Instant::now());
                    return Ok(words);
                }
                Err(err @ RecognizeError::Transient { .. })
                    if attempt < self.max_retries =>
                {
                    attempt += 1;
                    debug!("transient recognition failure, retry {attempt}: {err}");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) => {
                    self.last_request = None;
                    return Err(err);
                }
            }
        }
    }
}

/// Map Vision's text annotations to recognized words. Element 0 is the
/// full-page aggregate text and is skipped.
fn words_from_annotations(annotations: Vec<TextAnnotation>) -> Vec<RecognizedWord> {
    annotations
        .into_iter()
        .skip(1)
        .map(|annotation| RecognizedWord {
            text: annotation.description,
            quad: annotation
                .bounding_poly
                .map(|poly| poly.vertices)
                .unwrap_or_default(),
        })
        .collect()
}

/// Classify a structured API error into our taxonomy. This is the only
/// place error bodies are inspected.
fn classify_api_error(error: &ApiError) -> RecognizeError {
    let message = error.message.clone();
    for detail in &error.details {
        match detail.reason.as_deref() {
            Some("SERVICE_DISABLED") => {
                return RecognizeError::ServiceNotEnabled { message };
            }
            Some("API_KEY_INVALID") => {
                return RecognizeError::InvalidCredential { message };
            }
            Some(reason) if reason.starts_with("API_KEY_") => {
                // API_KEY_HTTP_REFERRER_BLOCKED, API_KEY_SERVICE_BLOCKED, etc.
                return RecognizeError::CredentialRestricted { message };
            }
            _ => {}
        }
    }
    match error.status.as_deref() {
        Some("PERMISSION_DENIED") => RecognizeError::CredentialRestricted { message },
        Some("UNAUTHENTICATED") => RecognizeError::InvalidCredential { message },
        _ => RecognizeError::Transient { message },
    }
}

/// Wire shape of a non-2xx Vision response.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

/// Wire shape of a `google.rpc.Status` error.
#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    reason: Option<String>,
}

/// Wire shape of a successful annotate response.
#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<PageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageResponse {
    #[serde(default)]
    text_annotations: Vec<TextAnnotation>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextAnnotation {
    #[serde(default)]
    description: String,
    #[serde(default)]
    bounding_poly: Option<BoundingPoly>,
}

#[derive(Debug, Deserialize)]
struct BoundingPoly {
    #[serde(default)]
    vertices: Vec<PixelPoint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(json: &str) -> RecognizeError {
        let body: ApiErrorBody = serde_json::from_str(json).unwrap();
        classify_api_error(&body.error)
    }

    #[test]
    fn service_disabled_is_fatal() {
        let err = classify(
            r#"{"error": {
                "code": 403,
                "message": "Cloud Vision API has not been used in project 12345 before or it is disabled.",
                "status": "PERMISSION_DENIED",
                "details": [{"@type": "type.googleapis.com/google.rpc.ErrorInfo",
                             "reason": "SERVICE_DISABLED"}]
            }}"#,
        );
        assert!(matches!(err, RecognizeError::ServiceNotEnabled { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn invalid_api_key_is_fatal() {
        let err = classify(
            r#"{"error": {
                "code": 400,
                "message": "API key not valid. Please pass a valid API key.",
                "status": "INVALID_ARGUMENT",
                "details": [{"@type": "type.googleapis.com/google.rpc.ErrorInfo",
                             "reason": "API_KEY_INVALID"}]
            }}"#,
        );
        assert!(matches!(err, RecognizeError::InvalidCredential { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn referrer_blocked_key_is_restricted() {
        let err = classify(
            r#"{"error": {
                "code": 403,
                "message": "Requests from referer <empty> are blocked.",
                "status": "PERMISSION_DENIED",
                "details": [{"@type": "type.googleapis.com/google.rpc.ErrorInfo",
                             "reason": "API_KEY_HTTP_REFERRER_BLOCKED"}]
            }}"#,
        );
        assert!(matches!(err, RecognizeError::CredentialRestricted { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn server_errors_are_transient() {
        let err = classify(
            r#"{"error": {"code": 503, "message": "backend unavailable",
                          "status": "UNAVAILABLE"}}"#,
        );
        assert!(matches!(err, RecognizeError::Transient { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn config_errors_explain_remediation() {
        let err = classify(
            r#"{"error": {"message": "disabled", "status": "PERMISSION_DENIED",
                          "details": [{"reason": "SERVICE_DISABLED"}]}}"#,
        );
        assert!(err.to_string().contains("Enable it"));
    }

    #[test]
    fn first_annotation_is_the_page_aggregate() {
        let response: AnnotateResponse = serde_json::from_str(
            r#"{"responses": [{"textAnnotations": [
                {"description": "Hello world",
                 "boundingPoly": {"vertices": [{"x": 0, "y": 0}, {"x": 100, "y": 0},
                                               {"x": 100, "y": 40}, {"x": 0, "y": 40}]}},
                {"description": "Hello",
                 "boundingPoly": {"vertices": [{"x": 0, "y": 10}, {"x": 40, "y": 10},
                                               {"x": 40, "y": 30}, {"x": 0, "y": 30}]}},
                {"description": "world",
                 "boundingPoly": {"vertices": [{"x": 50, "y": 10}, {"x": 100, "y": 10},
                                               {"x": 100, "y": 30}, {"x": 50, "y": 30}]}}
            ]}]}"#,
        )
        .unwrap();
        let page = response.responses.into_iter().next().unwrap();
        let words = words_from_annotations(page.text_annotations);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].text, "Hello");
        assert_eq!(words[1].text, "world");
        assert_eq!(words[1].quad[0], PixelPoint { x: 50.0, y: 10.0 });
    }

    #[test]
    fn omitted_vertex_coordinates_default_to_zero() {
        // Vision drops zero-valued fields from its JSON.
        let poly: BoundingPoly =
            serde_json::from_str(r#"{"vertices": [{"y": 5}, {"x": 10, "y": 5}, {"x": 10}, {}]}"#)
                .unwrap();
        assert_eq!(poly.vertices[0], PixelPoint { x: 0.0, y: 5.0 });
        assert_eq!(poly.vertices[3], PixelPoint { x: 0.0, y: 0.0 });
    }

    #[test]
    fn missing_bounding_poly_yields_empty_quad() {
        let words = words_from_annotations(vec![
            TextAnnotation {
                description: "aggregate".to_string(),
                bounding_poly: None,
            },
            TextAnnotation {
                description: "word".to_string(),
                bounding_poly: None,
            },
        ]);
        assert_eq!(words.len(), 1);
        assert!(words[0].quad.is_empty());
    }
}

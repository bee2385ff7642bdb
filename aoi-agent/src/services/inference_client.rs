//! Inference service client
//!
//! Uploads one image to `POST {base_url}/upload` (multipart field `image`) and
//! normalizes the response into an [`InferenceResult`].
//!
//! # Retry behaviour
//! Connection failures, timeouts and 5xx responses are retried per the
//! configured [`RetryPolicy`]; 4xx responses and malformed bodies surface
//! immediately. After the last attempt the caller gets
//! [`InferenceError::RetryExhausted`] naming the attempt count.
//!
//! # Accepted responses
//! - `application/json`: metadata, optionally with base64 images under
//!   `combined_image` / `mask_image` / `overlay_image`
//! - `multipart/*`: a JSON metadata part plus image parts named after their kind
//!
//! Anything else, or an empty body, is [`InferenceError::MalformedResponse`].
//! The client never writes files.

use crate::config::InferenceSettings;
use crate::error::InferenceError;
use crate::models::inference::{ArtifactKind, Artifacts, InferenceMetadata, InferenceResult};
use crate::utils::{RetryError, RetryPolicy, Sleeper, TokioSleeper};
use async_trait::async_trait;
use base64::Engine;
use reqwest::{header, multipart, Client, StatusCode};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// User-Agent header sent with every request
const USER_AGENT: &str = concat!("aoi-agent/", env!("CARGO_PKG_VERSION"));

/// Multipart field carrying the upload
const UPLOAD_FIELD: &str = "image";

/// Longest error body excerpt kept in error messages
const ERROR_BODY_EXCERPT: usize = 512;

/// Anything that can run inference on an image file
///
/// The pipeline depends on this trait so tests and alternative transports can
/// stand in for the HTTP client.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn infer(&self, image_path: &Path) -> Result<InferenceResult, InferenceError>;
}

/// HTTP client for the external segmentation service
pub struct InferenceClient {
    http_client: Client,
    endpoint: String,
    timeout: Duration,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl InferenceClient {
    pub fn new(settings: &InferenceSettings) -> Result<Self, InferenceError> {
        let http_client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(settings.timeout)
            .build()
            .map_err(|e| InferenceError::Request(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint: settings.upload_endpoint(),
            timeout: settings.timeout,
            retry: settings.retry.clone(),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Replace the delay source (tests inject a recording sleeper)
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// One upload attempt
    async fn send_once(
        &self,
        attempt: u32,
        file_name: &str,
        mime: &str,
        bytes: &[u8],
    ) -> Result<InferenceResult, InferenceError> {
        debug!(
            endpoint = %self.endpoint,
            attempt,
            bytes = bytes.len(),
            "Sending image to inference service"
        );

        let part = multipart::Part::bytes(bytes.to_vec())
            .file_name(file_name.to_string())
            .mime_str(mime)
            .map_err(|e| InferenceError::Request(format!("invalid MIME type '{}': {}", mime, e)))?;
        let form = multipart::Form::new().part(UPLOAD_FIELD, part);

        let response = self
            .http_client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.classify_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = response
            .bytes()
            .await
            .map_err(|e| self.classify_transport_error(e))?;

        if body.is_empty() {
            return Err(InferenceError::MalformedResponse("empty response body".into()));
        }

        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();

        if essence == "application/json" {
            parse_json_body(&body)
        } else if essence.starts_with("multipart/") {
            parse_multipart_body(&content_type, body.to_vec()).await
        } else if essence.is_empty() {
            Err(InferenceError::MalformedResponse(
                "response has no content type".into(),
            ))
        } else {
            Err(InferenceError::MalformedResponse(format!(
                "unexpected content type '{}'",
                essence
            )))
        }
    }

    fn classify_transport_error(&self, err: reqwest::Error) -> InferenceError {
        if err.is_timeout() {
            InferenceError::Timeout(self.timeout)
        } else if err.is_builder() {
            InferenceError::Request(err.to_string())
        } else {
            // Connect, reset, and body-read failures are all transient transport trouble
            InferenceError::Connect(err.to_string())
        }
    }
}

#[async_trait]
impl InferenceBackend for InferenceClient {
    async fn infer(&self, image_path: &Path) -> Result<InferenceResult, InferenceError> {
        let is_file = tokio::fs::metadata(image_path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(InferenceError::ImageNotFound(image_path.to_path_buf()));
        }

        let bytes = tokio::fs::read(image_path)
            .await
            .map_err(|_| InferenceError::ImageNotFound(image_path.to_path_buf()))?;

        let file_name = image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let mime = infer::get(&bytes)
            .map(|kind| kind.mime_type())
            .unwrap_or("application/octet-stream");

        info!(
            file = %image_path.display(),
            endpoint = %self.endpoint,
            "Submitting image for inference"
        );

        let outcome = self
            .retry
            .run(
                "inference upload",
                self.sleeper.as_ref(),
                InferenceError::is_retryable,
                |attempt| self.send_once(attempt, &file_name, mime, &bytes),
            )
            .await;

        match outcome {
            Ok(result) => {
                debug!(
                    file = %image_path.display(),
                    artifacts = result.artifacts.iter().count(),
                    "Inference response accepted"
                );
                Ok(result)
            }
            Err(RetryError::Fatal(e)) => Err(e),
            Err(RetryError::Exhausted { attempts, last }) => Err(InferenceError::RetryExhausted {
                attempts,
                last: Box::new(last),
            }),
        }
    }
}

fn status_error(status: StatusCode, body: &str) -> InferenceError {
    let message: String = body.chars().take(ERROR_BODY_EXCERPT).collect();
    if status.is_server_error() {
        InferenceError::Server {
            status: status.as_u16(),
            message,
        }
    } else {
        InferenceError::ClientRequest {
            status: status.as_u16(),
            message,
        }
    }
}

/// Parse a JSON response body into metadata plus embedded images
pub fn parse_json_body(body: &[u8]) -> Result<InferenceResult, InferenceError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| InferenceError::MalformedResponse(format!("invalid JSON: {}", e)))?;

    let Value::Object(mut map) = value else {
        return Err(InferenceError::MalformedResponse(
            "JSON body is not an object".into(),
        ));
    };

    let mut artifacts = Artifacts::default();
    for kind in ArtifactKind::ALL {
        match map.remove(kind.json_field()) {
            None | Some(Value::Null) => {}
            Some(Value::String(encoded)) => artifacts.set(kind, decode_base64_image(&encoded)?),
            Some(_) => {
                return Err(InferenceError::MalformedResponse(format!(
                    "'{}' is not a base64 string",
                    kind.json_field()
                )))
            }
        }
    }

    let metadata = InferenceMetadata::from_map(map)?;
    Ok(InferenceResult {
        metadata,
        artifacts,
    })
}

/// Decode base64 image data, tolerating a `data:<mime>;base64,` prefix
fn decode_base64_image(encoded: &str) -> Result<Vec<u8>, InferenceError> {
    let data = match encoded.find(";base64,") {
        Some(pos) if encoded.starts_with("data:") => &encoded[pos + ";base64,".len()..],
        _ => encoded,
    };
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| InferenceError::MalformedResponse(format!("invalid base64 image: {}", e)))
}

/// Extract the `boundary` parameter from a multipart content type
fn multipart_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

/// Which artifact a multipart part carries, judged by field name then file name
fn artifact_kind_for(name: &str, file_name: &str) -> Option<ArtifactKind> {
    // Overlay before mask: overlay parts are sometimes named "mask_overlay"
    [ArtifactKind::Combined, ArtifactKind::Overlay, ArtifactKind::Mask]
        .into_iter()
        .find(|kind| name.contains(kind.as_str()))
        .or_else(|| {
            [ArtifactKind::Combined, ArtifactKind::Overlay, ArtifactKind::Mask]
                .into_iter()
                .find(|kind| file_name.contains(kind.as_str()))
        })
}

async fn parse_multipart_body(
    content_type: &str,
    body: Vec<u8>,
) -> Result<InferenceResult, InferenceError> {
    let boundary = multipart_boundary(content_type).ok_or_else(|| {
        InferenceError::MalformedResponse("multipart response without boundary".into())
    })?;

    let stream = futures::stream::once(async move { Ok::<_, std::io::Error>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut metadata: Option<InferenceMetadata> = None;
    let mut artifacts = Artifacts::default();

    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| InferenceError::MalformedResponse(format!("invalid multipart body: {}", e)))?;
        let Some(field) = field else { break };

        let name = field.name().unwrap_or("").to_ascii_lowercase();
        let file_name = field.file_name().unwrap_or("").to_ascii_lowercase();
        let is_json = field
            .content_type()
            .map(|mime| mime.essence_str().ends_with("json"))
            .unwrap_or(false);

        let data = field
            .bytes()
            .await
            .map_err(|e| InferenceError::MalformedResponse(format!("invalid multipart part: {}", e)))?;

        if is_json || matches!(name.as_str(), "metadata" | "result" | "result_json") {
            let parsed = parse_json_body(&data)?;
            artifacts.fill_missing(parsed.artifacts);
            metadata = Some(parsed.metadata);
        } else if let Some(kind) = artifact_kind_for(&name, &file_name) {
            artifacts.set(kind, data.to_vec());
        } else {
            debug!(part = %name, file_name = %file_name, "Ignoring unrecognised multipart part");
        }
    }

    let metadata = metadata.ok_or_else(|| {
        InferenceError::MalformedResponse("multipart response has no JSON metadata part".into())
    })?;

    Ok(InferenceResult {
        metadata,
        artifacts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_parsing() {
        assert_eq!(
            multipart_boundary("multipart/mixed; boundary=abc123").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            multipart_boundary("multipart/form-data; charset=utf-8; Boundary=\"x y\"").as_deref(),
            Some("x y")
        );
        assert_eq!(multipart_boundary("multipart/mixed"), None);
    }

    #[test]
    fn test_part_identification() {
        assert_eq!(artifact_kind_for("combined_image", ""), Some(ArtifactKind::Combined));
        assert_eq!(artifact_kind_for("file", "img_mask.png"), Some(ArtifactKind::Mask));
        assert_eq!(artifact_kind_for("mask_overlay", ""), Some(ArtifactKind::Overlay));
        assert_eq!(artifact_kind_for("thumbnail", "thumb.png"), None);
    }

    #[test]
    fn test_json_body_with_embedded_images() {
        let mask = base64::engine::general_purpose::STANDARD.encode([137u8, 80, 78, 71]);
        let body = format!(
            r#"{{"success": true, "total_defects": 2, "mask_image": "data:image/png;base64,{}", "overlay_image": null}}"#,
            mask
        );

        let result = parse_json_body(body.as_bytes()).unwrap();
        assert_eq!(result.artifacts.mask.as_deref(), Some(&[137u8, 80, 78, 71][..]));
        assert!(result.artifacts.overlay.is_none());
        assert!(!result.metadata.raw.contains_key("mask_image"));
        assert_eq!(result.metadata.total_defects, Some(2));
    }

    #[test]
    fn test_json_body_rejects_non_object_and_bad_base64() {
        assert!(matches!(
            parse_json_body(b"[1, 2, 3]"),
            Err(InferenceError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_json_body(br#"{"mask_image": "***not base64***"}"#),
            Err(InferenceError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_json_body(b"not json"),
            Err(InferenceError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "missing"),
            InferenceError::ClientRequest { status: 404, .. }
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, ""),
            InferenceError::Server { status: 502, .. }
        ));
    }

    #[tokio::test]
    async fn test_multipart_body_parsing() {
        let body = concat!(
            "--BOUNDARY\r\n",
            "Content-Disposition: form-data; name=\"metadata\"\r\n",
            "Content-Type: application/json\r\n\r\n",
            "{\"success\": true, \"processing_time\": 1.5}\r\n",
            "--BOUNDARY\r\n",
            "Content-Disposition: form-data; name=\"mask\"; filename=\"x_mask.png\"\r\n",
            "Content-Type: image/png\r\n\r\n",
            "MASKDATA\r\n",
            "--BOUNDARY--\r\n",
        );

        let result = parse_multipart_body(
            "multipart/mixed; boundary=BOUNDARY",
            body.as_bytes().to_vec(),
        )
        .await
        .unwrap();

        assert_eq!(result.metadata.processing_time, Some(1.5));
        assert_eq!(result.artifacts.mask.as_deref(), Some(&b"MASKDATA"[..]));
        assert!(result.artifacts.combined.is_none());
    }

    #[tokio::test]
    async fn test_multipart_without_metadata_is_malformed() {
        let body = concat!(
            "--B\r\n",
            "Content-Disposition: form-data; name=\"overlay\"\r\n\r\n",
            "PIXELS\r\n",
            "--B--\r\n",
        );

        let result = parse_multipart_body(
            "multipart/mixed; boundary=B",
            body.as_bytes().to_vec(),
        )
        .await;
        assert!(matches!(result, Err(InferenceError::MalformedResponse(_))));
    }
}

//! Normalized inference service results

use crate::error::InferenceError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Image payloads the service can return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Side-by-side original and overlay
    Combined,
    /// Per-pixel classification mask
    Mask,
    /// Mask blended over the input
    Overlay,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [
        ArtifactKind::Combined,
        ArtifactKind::Mask,
        ArtifactKind::Overlay,
    ];

    /// Type tag used in artifact file names (`<imageId>_<tag>.png`)
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Combined => "combined",
            ArtifactKind::Mask => "mask",
            ArtifactKind::Overlay => "overlay",
        }
    }

    /// Field carrying the base64 payload in JSON responses
    pub fn json_field(self) -> &'static str {
        match self {
            ArtifactKind::Combined => "combined_image",
            ArtifactKind::Mask => "mask_image",
            ArtifactKind::Overlay => "overlay_image",
        }
    }
}

/// Up to three image payloads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Artifacts {
    pub combined: Option<Vec<u8>>,
    pub mask: Option<Vec<u8>>,
    pub overlay: Option<Vec<u8>>,
}

impl Artifacts {
    pub fn get(&self, kind: ArtifactKind) -> Option<&[u8]> {
        match kind {
            ArtifactKind::Combined => self.combined.as_deref(),
            ArtifactKind::Mask => self.mask.as_deref(),
            ArtifactKind::Overlay => self.overlay.as_deref(),
        }
    }

    /// Empty payloads are treated as absent
    pub fn set(&mut self, kind: ArtifactKind, bytes: Vec<u8>) {
        let slot = match kind {
            ArtifactKind::Combined => &mut self.combined,
            ArtifactKind::Mask => &mut self.mask,
            ArtifactKind::Overlay => &mut self.overlay,
        };
        *slot = if bytes.is_empty() { None } else { Some(bytes) };
    }

    /// Present payloads in `ArtifactKind::ALL` order
    pub fn iter(&self) -> impl Iterator<Item = (ArtifactKind, &[u8])> + '_ {
        ArtifactKind::ALL
            .into_iter()
            .filter_map(move |kind| self.get(kind).map(|bytes| (kind, bytes)))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Fill slots that are still empty from `other`
    pub fn fill_missing(&mut self, other: Artifacts) {
        if self.combined.is_none() {
            self.combined = other.combined;
        }
        if self.mask.is_none() {
            self.mask = other.mask;
        }
        if self.overlay.is_none() {
            self.overlay = other.overlay;
        }
    }
}

/// Metadata returned alongside the images
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceMetadata {
    /// Seconds spent inside the service
    pub processing_time: Option<f64>,
    pub total_defects: Option<u64>,
    pub timestamp: Option<String>,
    pub filename: Option<String>,
    pub success: Option<bool>,
    /// Remaining fields with image payloads stripped
    pub raw: Map<String, Value>,
}

impl InferenceMetadata {
    /// Lift known fields out of a response object
    ///
    /// A service-reported failure (`"success": false`) is malformed for our
    /// purposes since it carries no usable result.
    pub fn from_map(raw: Map<String, Value>) -> Result<Self, InferenceError> {
        let success = raw.get("success").and_then(Value::as_bool);
        if success == Some(false) {
            let reason = raw
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("no error detail");
            return Err(InferenceError::MalformedResponse(format!(
                "service reported failure: {}",
                reason
            )));
        }

        Ok(Self {
            processing_time: raw
                .get("processing_time")
                .and_then(Value::as_f64)
                .filter(|t| t.is_finite() && *t >= 0.0),
            total_defects: raw.get("total_defects").and_then(Value::as_u64),
            timestamp: raw.get("timestamp").and_then(Value::as_str).map(String::from),
            filename: raw.get("filename").and_then(Value::as_str).map(String::from),
            success,
            raw,
        })
    }
}

/// One normalized inference call result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceResult {
    pub metadata: InferenceMetadata,
    pub artifacts: Artifacts,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_known_fields() {
        let raw = json!({
            "success": true,
            "processing_time": 12.5,
            "total_defects": 3,
            "timestamp": "2024-03-01T10:00:00",
            "analysis_results": {"classes": []}
        });
        let Value::Object(map) = raw else { unreachable!() };

        let metadata = InferenceMetadata::from_map(map).unwrap();
        assert_eq!(metadata.processing_time, Some(12.5));
        assert_eq!(metadata.total_defects, Some(3));
        assert!(metadata.raw.contains_key("analysis_results"));
    }

    #[test]
    fn test_service_failure_is_malformed() {
        let Value::Object(map) = json!({"success": false, "error": "model not loaded"}) else {
            unreachable!()
        };
        let err = InferenceMetadata::from_map(map).unwrap_err();
        assert!(err.to_string().contains("model not loaded"));
    }

    #[test]
    fn test_artifacts_iteration_skips_empty() {
        let mut artifacts = Artifacts::default();
        assert!(artifacts.is_empty());

        artifacts.set(ArtifactKind::Overlay, vec![1, 2, 3]);
        artifacts.set(ArtifactKind::Combined, Vec::new());

        let kinds: Vec<_> = artifacts.iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec![ArtifactKind::Overlay]);
    }
}

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSON_PATCH_TYPE: &str = "JSONPatch";

/// The admission-review envelope as the API server sends and expects it.
/// The group/version of the incoming review is reflected back verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub object: Option<Value>,
}

impl AdmissionRequest {
    pub fn decode_pod(&self) -> Result<Pod, serde_json::Error> {
        serde_json::from_value(self.object.clone().unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

impl AdmissionResponse {
    /// This webhook never denies: the worst outcome is an un-injected pod.
    pub fn allow(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            allowed: true,
            patch: None,
            patch_type: None,
            warnings: None,
        }
    }

    pub fn with_patch(mut self, patch: &json_patch::Patch) -> Result<Self, serde_json::Error> {
        let encoded = BASE64.encode(serde_json::to_vec(patch)?);
        self.patch = Some(encoded);
        self.patch_type = Some(JSON_PATCH_TYPE.to_string());
        Ok(self)
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        if !warnings.is_empty() {
            self.warnings = Some(warnings);
        }
        self
    }
}

impl AdmissionReview {
    /// Wraps a response in an envelope mirroring the request's group/version.
    pub fn respond(&self, response: AdmissionResponse) -> AdmissionReview {
        AdmissionReview {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            request: None,
            response: Some(response),
        }
    }
}

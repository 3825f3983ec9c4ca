use serde::{Deserialize, Serialize};

/// A caption request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionRequest {
    pub id: String,
    pub image: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CaptionResponse {
    pub caption: String,
    pub file_size: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
}

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::fetch::{FetchError, FetchedImage};
use crate::models::{CaptionRequest, CaptionResponse, ErrorResponse, HealthResponse};
use crate::AppState;

// ── Constants ────────────────────────────────────────────────────────────────

/// Images strictly smaller than this many bytes are labelled `small`.
pub const SMALL_IMAGE_MAX_BYTES: usize = 50 * 1024;

/// Number of hex characters of the SHA-256 digest shown in captions.
pub const HASH_PREFIX_LEN: usize = 16;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request body is not a JSON object: {0}")]
    InvalidJson(String),
    #[error("image field is missing or empty")]
    MissingImage,
}

impl RequestError {
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::InvalidJson(_) => "invalid_json",
            RequestError::MissingImage => "missing_image",
        }
    }
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let body = ErrorResponse { error: self.code() };
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

pub async fn caption(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            error!(error = %rejection, "could not read caption request body");
            return RequestError::InvalidJson(rejection.body_text()).into_response();
        }
    };

    let req = match parse_caption_request(&body) {
        Ok(req) => req,
        Err(e) => return e.into_response(),
    };

    let fetched = state.fetcher.fetch(&req.image, &req.id).await;
    (StatusCode::OK, Json(build_caption(&req, fetched))).into_response()
}

// ── Request validation ───────────────────────────────────────────────────────

/// Parse and check an untrusted request body.
///
/// `image` is checked before `id`, so a body without an image always yields
/// `missing_image`. URL syntax is left to the fetcher.
pub fn parse_caption_request(body: &[u8]) -> Result<CaptionRequest, RequestError> {
    let fields: Map<String, Value> = match serde_json::from_slice(body) {
        Ok(fields) => fields,
        Err(e) => {
            error!(
                body = %String::from_utf8_lossy(body),
                error = %e,
                "invalid JSON in caption request"
            );
            return Err(RequestError::InvalidJson(e.to_string()));
        }
    };

    let image = match fields.get("image") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.trim()).filter(|s| !s.is_empty()),
        Some(other) => {
            error!(image = %other, "image field is not a string");
            return Err(RequestError::InvalidJson("image must be a string".to_string()));
        }
    };
    let Some(image) = image else {
        error!(body = %String::from_utf8_lossy(body), "caption request without image");
        return Err(RequestError::MissingImage);
    };

    let id = match fields.get("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        _ => {
            error!(body = %String::from_utf8_lossy(body), "caption request without usable id");
            return Err(RequestError::InvalidJson(
                "id must be a non-empty string".to_string(),
            ));
        }
    };

    info!(
        id = %id,
        image = %image,
        body = %String::from_utf8_lossy(body),
        "caption request"
    );
    Ok(CaptionRequest {
        id,
        image: image.to_string(),
    })
}

// ── Pseudo-analysis ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Small,
    Large,
}

impl SizeClass {
    pub fn of(len: usize) -> Self {
        if len < SMALL_IMAGE_MAX_BYTES {
            SizeClass::Small
        } else {
            SizeClass::Large
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SizeClass::Small => "small",
            SizeClass::Large => "large",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub file_size: usize,
    pub sha256_prefix: String,
    pub size_class: SizeClass,
}

pub fn analyze(bytes: &[u8]) -> Analysis {
    let digest = hex::encode(Sha256::digest(bytes));
    Analysis {
        file_size: bytes.len(),
        sha256_prefix: digest[..HASH_PREFIX_LEN].to_string(),
        size_class: SizeClass::of(bytes.len()),
    }
}

// ── Response building ────────────────────────────────────────────────────────

pub fn build_caption(
    req: &CaptionRequest,
    fetched: Result<FetchedImage, FetchError>,
) -> CaptionResponse {
    match fetched {
        Ok(image) => {
            let analysis = analyze(&image.bytes);
            info!(
                id = %req.id,
                bytes = analysis.file_size,
                sha16 = %analysis.sha256_prefix,
                class = analysis.size_class.as_str(),
                "image analyzed"
            );
            success_caption(&req.id, &analysis)
        }
        Err(e) => failure_caption(&req.id, &e),
    }
}

fn success_caption(id: &str, analysis: &Analysis) -> CaptionResponse {
    CaptionResponse {
        caption: format!(
            "debug: id={} size={}B sha16={} class={}",
            id,
            analysis.file_size,
            analysis.sha256_prefix,
            analysis.size_class.as_str()
        ),
        file_size: analysis.file_size as u64,
    }
}

fn failure_caption(id: &str, err: &FetchError) -> CaptionResponse {
    CaptionResponse {
        caption: format!("debug: id={} image download failed: {}", id, err),
        file_size: 0,
    }
}

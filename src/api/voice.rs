//! Voice API endpoints for direct synthesis

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::ApiState;
use crate::config::SynthesisStrategy;
use crate::voice::Voice;

/// Build voice router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/synthesize", post(synthesize))
        .route("/voices", get(voices))
        .route("/capabilities", get(capabilities))
        .with_state(state)
}

/// Voice capabilities response
#[derive(Debug, Serialize)]
pub struct VoiceCapabilities {
    pub stt_available: bool,
    pub llm_available: bool,
    pub tts_available: bool,
    pub synthesis_strategy: SynthesisStrategy,
    pub sample_rate: u32,
}

/// Get voice capabilities
async fn capabilities(State(state): State<Arc<ApiState>>) -> Json<VoiceCapabilities> {
    Json(VoiceCapabilities {
        stt_available: state.providers.recognizer.is_some(),
        llm_available: state.providers.generator.is_some(),
        tts_available: state.providers.speech.is_some(),
        synthesis_strategy: state.config.synthesis.strategy,
        sample_rate: state.config.recognition.sample_rate,
    })
}

/// Synthesis request
#[derive(Debug, Deserialize)]
pub struct SynthesizeRequest {
    pub text: String,
}

/// Synthesize text to speech
///
/// Returns audio in the configured format
async fn synthesize(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SynthesizeRequest>,
) -> Result<Response, VoiceError> {
    let speech = state
        .providers
        .speech
        .as_ref()
        .ok_or(VoiceError::NotConfigured("TTS not configured (no Murf key)"))?;

    if request.text.trim().is_empty() {
        return Err(VoiceError::BadRequest("Empty text"));
    }

    let audio = speech
        .synthesize(&request.text)
        .await
        .map_err(|e| VoiceError::SynthesisFailed(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, speech.content_type())],
        audio,
    )
        .into_response())
}

/// Voice listing response
#[derive(Debug, Serialize)]
pub struct VoicesResponse {
    pub voices: Vec<Voice>,
}

/// List voices offered by the synthesis backend
async fn voices(State(state): State<Arc<ApiState>>) -> Result<Json<VoicesResponse>, VoiceError> {
    let speech = state
        .providers
        .speech
        .as_ref()
        .ok_or(VoiceError::NotConfigured("TTS not configured (no Murf key)"))?;

    let voices = speech
        .voices()
        .await
        .map_err(|e| VoiceError::Upstream(e.to_string()))?;

    Ok(Json(VoicesResponse { voices }))
}

/// Voice API errors
#[derive(Debug)]
pub enum VoiceError {
    NotConfigured(&'static str),
    BadRequest(&'static str),
    SynthesisFailed(String),
    Upstream(String),
}

impl IntoResponse for VoiceError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: ErrorBody,
        }

        #[derive(Serialize)]
        struct ErrorBody {
            code: &'static str,
            message: String,
        }

        let (status, code, message) = match self {
            Self::NotConfigured(msg) => (StatusCode::SERVICE_UNAVAILABLE, "not_configured", msg.to_string()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.to_string()),
            Self::SynthesisFailed(msg) => (StatusCode::BAD_GATEWAY, "synthesis_failed", msg),
            Self::Upstream(msg) => (StatusCode::BAD_GATEWAY, "upstream_error", msg),
        };

        (status, Json(ErrorResponse { error: ErrorBody { code, message } })).into_response()
    }
}

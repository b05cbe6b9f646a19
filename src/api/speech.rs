//! Text-to-speech endpoint
//!
//! Synthesizes arbitrary text with the configured voice and returns a WAV
//! file. Nothing is played and turn state is untouched.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use futures::StreamExt;
use serde::Deserialize;

use super::{ApiError, ApiState};
use crate::Error;
use crate::error::Stage;
use crate::turn::with_deadline;
use crate::voice::samples_to_wav;

#[derive(Debug, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
}

async fn synthesize(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SpeechRequest>,
) -> Result<Response, ApiError> {
    let text = request.text.trim();
    if text.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_input",
            "text must not be empty",
        ));
    }

    let Some(synthesizer) = &state.synthesizer else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            "text-to-speech is not configured",
        ));
    };

    let mut stream = with_deadline(
        Stage::Synthesis,
        state.tts_deadline,
        synthesizer.synthesize(text),
    )
    .await?;

    let mut samples = Vec::new();
    while let Some(block) = tokio::time::timeout(state.tts_deadline, stream.next())
        .await
        .map_err(|_| Error::Timeout(Stage::Synthesis))?
    {
        samples.extend(block?);
    }

    if samples.is_empty() {
        return Err(Error::Tts("no audio returned".to_string()).into());
    }

    let wav = samples_to_wav(&samples, state.playback_rate)?;
    tracing::debug!(chars = text.len(), samples = samples.len(), "speech synthesized");

    Ok(([(header::CONTENT_TYPE, "audio/wav")], wav).into_response())
}

/// Build text-to-speech router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new().route("/", post(synthesize)).with_state(state)
}

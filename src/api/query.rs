//! Text query endpoint
//!
//! Same retrieval and generation as a spoken turn, without audio and
//! without touching turn state or conversation history.

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiState};
use crate::agent::GenerationRequest;
use crate::error::Stage;
use crate::session::SourceRef;
use crate::turn::with_deadline;
use crate::Error;

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    /// Who is asking; passed to the model as context
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<SourceRef>,
}

async fn query(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    let question = request.query.trim();
    if question.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_input",
            "query must not be empty",
        ));
    }

    let (Some(retriever), Some(generator)) = (&state.retriever, &state.generator) else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            "query is not configured",
        ));
    };

    let context = match tokio::time::timeout(
        state.retrieval_timeout,
        retriever.retrieve(question, state.retrieval_k),
    )
    .await
    {
        Ok(chunks) => chunks,
        Err(_) => {
            tracing::warn!("retrieval timed out; answering without context");
            Vec::new()
        }
    };
    let sources = context.iter().map(SourceRef::from).collect();

    let generation = GenerationRequest {
        transcript: question.to_string(),
        context,
        history: Vec::new(),
        role: request.role.clone(),
    };
    let mut stream = with_deadline(
        Stage::Generation,
        state.llm_deadline,
        generator.generate(generation),
    )
    .await?;

    let mut fragments = Vec::new();
    while let Some(fragment) = tokio::time::timeout(state.llm_deadline, stream.next())
        .await
        .map_err(|_| Error::Timeout(Stage::Generation))?
    {
        fragments.push(fragment?);
    }

    tracing::debug!(fragments = fragments.len(), "query answered");

    Ok(Json(QueryResponse {
        answer: fragments.concat(),
        sources,
    }))
}

/// Build query router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new().route("/", post(query)).with_state(state)
}

use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Graph backend error: {0}")]
    GraphBackend(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("GraphRAG disabled")]
    Disabled,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Index run locked: {0}")]
    Locked(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GraphError {
    /// Short category string surfaced in structured error payloads.
    pub fn category(&self) -> &'static str {
        match self {
            GraphError::InvalidInput(_) => "invalid-input",
            GraphError::NotFound(_) => "not-found",
            GraphError::Disabled => "disabled",
            GraphError::Unauthorized(_) => "unauthorized",
            GraphError::Locked(_) => "locked",
            GraphError::Upstream(_) => "upstream",
            GraphError::Database(_) => "store-failure",
            GraphError::GraphBackend(_) => "store-failure",
            GraphError::VectorStore(_) => "vector-store",
            _ => "internal",
        }
    }
}

impl ResponseError for GraphError {
    fn error_response(&self) -> HttpResponse {
        let status_code = match self {
            GraphError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GraphError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GraphError::NotFound(_) => StatusCode::NOT_FOUND,
            GraphError::Disabled => StatusCode::FORBIDDEN,
            GraphError::Locked(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        HttpResponse::build(status_code).json(serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "category": self.category(),
        }))
    }
}

pub type GraphResult<T> = Result<T, GraphError>;

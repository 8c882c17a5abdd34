use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    NotFound,
    AlreadyExists,
    RateLimited,
    Timeout,
    Cancelled,
    Closed,
    Execution,
    Persistence,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:session-runtime:error:invalid_request",
            Self::NotFound => "urn:session-runtime:error:not_found",
            Self::AlreadyExists => "urn:session-runtime:error:already_exists",
            Self::RateLimited => "urn:session-runtime:error:rate_limited",
            Self::Timeout => "urn:session-runtime:error:timeout",
            Self::Cancelled => "urn:session-runtime:error:cancelled",
            Self::Closed => "urn:session-runtime:error:closed",
            Self::Execution => "urn:session-runtime:error:execution",
            Self::Persistence => "urn:session-runtime:error:persistence",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::NotFound => "Not Found",
            Self::AlreadyExists => "Already Exists",
            Self::RateLimited => "Rate Limited",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::Closed => "Closed",
            Self::Execution => "Execution Failed",
            Self::Persistence => "Persistence Failed",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::NotFound => 404,
            Self::AlreadyExists => 409,
            Self::RateLimited => 429,
            Self::Timeout => 504,
            // Non-standard "client closed request", matching common proxy usage.
            Self::Cancelled => 499,
            Self::Closed => 410,
            Self::Execution => 502,
            Self::Persistence => 503,
        }
    }
}

/// Which bucket rejected an admission request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    Global,
    User,
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::User => f.write_str("user"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },
    #[error("stream client not found: {client_id}")]
    ClientNotFound { client_id: String },
    #[error("agent already exists: {agent_id}")]
    AgentAlreadyExists { agent_id: String },
    #[error("rate limited ({scope})")]
    RateLimited {
        scope: RateLimitScope,
        user_id: Option<String>,
    },
    #[error("timeout")]
    Timeout { message: Option<String> },
    #[error("cancelled")]
    Cancelled,
    #[error("{resource} closed")]
    Closed { resource: String },
    #[error("agent execution failed: {message}")]
    Execution { message: String },
    #[error("persistence failed: {message}")]
    Persistence { message: String },
}

impl RuntimeError {
    pub fn closed(resource: impl Into<String>) -> Self {
        Self::Closed {
            resource: resource.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: Some(message.into()),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::SessionNotFound { .. }
            | Self::AgentNotFound { .. }
            | Self::ClientNotFound { .. } => ErrorType::NotFound,
            Self::AgentAlreadyExists { .. } => ErrorType::AlreadyExists,
            Self::RateLimited { .. } => ErrorType::RateLimited,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::Cancelled => ErrorType::Cancelled,
            Self::Closed { .. } => ErrorType::Closed,
            Self::Execution { .. } => ErrorType::Execution,
            Self::Persistence { .. } => ErrorType::Persistence,
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.error_type(),
            ErrorType::RateLimited | ErrorType::Timeout | ErrorType::Persistence
        )
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        match self {
            Self::SessionNotFound { session_id } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::AgentNotFound { agent_id } | Self::AgentAlreadyExists { agent_id } => {
                extensions.insert("agentId".to_string(), Value::String(agent_id.clone()));
            }
            Self::ClientNotFound { client_id } => {
                extensions.insert("clientId".to_string(), Value::String(client_id.clone()));
            }
            Self::RateLimited { scope, user_id } => {
                extensions.insert("scope".to_string(), Value::String(scope.to_string()));
                if let Some(user_id) = user_id {
                    extensions.insert("userId".to_string(), Value::String(user_id.clone()));
                }
            }
            Self::Timeout {
                message: Some(message),
            } => {
                let mut map = Map::new();
                map.insert("message".to_string(), Value::String(message.clone()));
                extensions.insert("details".to_string(), Value::Object(map));
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<RuntimeError> for ProblemDetails {
    fn from(value: RuntimeError) -> Self {
        value.to_problem_details()
    }
}

impl From<&RuntimeError> for ProblemDetails {
    fn from(value: &RuntimeError) -> Self {
        value.to_problem_details()
    }
}

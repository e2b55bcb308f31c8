use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("Invalid transition \"{intent}\" for {card_type}:{state}")]
    InvalidTransition {
        intent: String,
        card_type: String,
        state: String,
    },
    #[error("transport failure [{code}]: {message}")]
    Transport { code: String, message: String },
}

impl DomainError {
    pub fn transport(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Stable code used when a failure has to be stamped onto local state
    /// (failed optimistic messages, failed uploads).
    pub fn error_code(&self) -> String {
        match self {
            Self::Validation(_) => "VALIDATION".to_string(),
            Self::NotFound => "NOT_FOUND".to_string(),
            Self::Conflict => "CONFLICT".to_string(),
            Self::InvalidTransition { .. } => "INVALID_TRANSITION".to_string(),
            Self::Transport { code, .. } => code.clone(),
        }
    }
}

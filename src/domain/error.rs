use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("unknown table `{name}`")]
    UnknownTable { name: String },
    #[error("unknown row operation `{name}`")]
    UnknownOperation { name: String },
    #[error("domain validation failed: {message}")]
    Validation { message: String },
}

impl DomainError {
    pub fn unknown_table(name: impl Into<String>) -> Self {
        Self::UnknownTable { name: name.into() }
    }

    pub fn unknown_operation(name: impl Into<String>) -> Self {
        Self::UnknownOperation { name: name.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

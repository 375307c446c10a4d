use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid {kind} id: {value}")]
    InvalidId { kind: &'static str, value: String },

    #[error("Invalid {kind}: {value}")]
    InvalidEnum { kind: &'static str, value: String },

    #[error("Invalid file name: {0}")]
    InvalidFileName(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Authentication required")]
    Missing,

    #[error("Invalid session: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TagError {
    #[error("not initialized: run 'nodetag init'")]
    NotInitialized,

    #[error("tag not found: {0}")]
    TagNotFound(String),

    #[error("tag already exists: {0}")]
    TagExists(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node already registered: {0}")]
    NodeExists(String),

    #[error("invalid name '{0}': must be letters, digits, hyphens, or underscores")]
    InvalidName(String),

    #[error("invalid definition '{expression}': {reason}")]
    InvalidDefinition { expression: String, reason: String },

    #[error("definition mismatch: expected '{expected}', tag now has '{actual}'")]
    DefinitionChanged { expected: String, actual: String },

    #[error("cannot evaluate '{expression}': {reason}")]
    Evaluation { expression: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TagError>;

/// Fatal configuration errors raised while resolving the run environment.
///
/// Every variant aborts the run before any side effect takes place.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Missing required environment variable {name}: {hint}")]
    MissingEnv { name: &'static str, hint: &'static str },

    #[error("Invalid value for {name}: {reason}")]
    InvalidEnv { name: &'static str, reason: String },

    #[error("Validation failed: {0}")]
    Validation(String),
}

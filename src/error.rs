//! Error types for the Gitea Operator

use thiserror::Error;

/// Result type for the operator
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the operator
#[derive(Debug, Error)]
pub enum Error {
    /// The Gitea resource is malformed
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No template asset exists for the requested name
    #[error("Template not found: {template}")]
    TemplateNotFound { template: String },

    /// The template asset failed to compile
    #[error("Template syntax error in '{template}': {source}")]
    TemplateSyntax {
        template: String,
        #[source]
        source: minijinja::Error,
    },

    /// Expanding the template against the parameter set failed
    #[error("Render error in '{template}': {message}")]
    Render { template: String, message: String },

    /// The rendered text is not a well-formed resource document
    #[error("Parse error in rendered '{template}': {message}")]
    Parse { template: String, message: String },

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Secret error
    #[error("Secret error: {0}")]
    SecretError(String),

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

impl Error {
    /// Whether a later pass can succeed without someone first fixing the
    /// resource or the template library
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(_) => true,
            Error::FinalizerError(inner) => match inner.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(e)
                | kube::runtime::finalizer::Error::CleanupFailed(e) => e.is_retryable(),
                _ => true,
            },
            Error::InvalidInput(_)
            | Error::TemplateNotFound { .. }
            | Error::TemplateSyntax { .. }
            | Error::Render { .. }
            | Error::Parse { .. }
            | Error::ConfigError(_)
            | Error::SecretError(_) => false,
        }
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        Error::FinalizerError(Box::new(err))
    }
}

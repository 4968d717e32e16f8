//! Configuration errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Every configuration problem surfaces as a validation failure before anything runs.
impl From<ConfigError> for kubedeploy_core::Error {
    fn from(err: ConfigError) -> Self {
        kubedeploy_core::Error::Validation(err.to_string())
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maps_to_validation_error() {
        let err: kubedeploy_core::Error = ConfigError::MissingField("token".to_string()).into();
        assert!(matches!(err, kubedeploy_core::Error::Validation(ref m) if m.contains("token")));
    }
}

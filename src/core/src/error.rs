use thiserror::Error;

/// Strata error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// Malformed image reference
    #[error("Invalid image reference: {0}")]
    ReferenceError(String),

    /// Container registry error (network, auth, missing blobs)
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Layer could not be built from the local source
    #[error("Layer error: {0}")]
    LayerError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// OCI image error
    #[error("OCI image error: {0}")]
    OciImageError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl StrataError {
    /// Build a registry error for the given registry host.
    pub fn registry(registry: impl Into<String>, message: impl Into<String>) -> Self {
        StrataError::RegistryError {
            registry: registry.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::SerializationError(err.to_string())
    }
}

/// Result type alias for strata operations
pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_error_display() {
        let error = StrataError::ReferenceError("Empty image reference".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid image reference: Empty image reference"
        );
    }

    #[test]
    fn test_registry_error_display() {
        let error = StrataError::registry("ghcr.io", "Failed to push image: denied");
        assert_eq!(
            error.to_string(),
            "Registry error: ghcr.io - Failed to push image: denied"
        );
    }

    #[test]
    fn test_layer_error_display() {
        let error = StrataError::LayerError("Failed to read /data.tar".to_string());
        assert_eq!(error.to_string(), "Layer error: Failed to read /data.tar");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: StrataError = io_error.into();
        assert!(matches!(error, StrataError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: StrataError = json_error.into();
        assert!(matches!(error, StrataError::SerializationError(_)));
        assert!(error.to_string().starts_with("Serialization error:"));
    }

    #[test]
    fn test_config_error_display() {
        let error = StrataError::ConfigError("--dest required".to_string());
        assert_eq!(error.to_string(), "Configuration error: --dest required");
    }

    #[test]
    fn test_other_error_display() {
        let error = StrataError::Other("Something went wrong".to_string());
        assert_eq!(error.to_string(), "Something went wrong");
    }
}

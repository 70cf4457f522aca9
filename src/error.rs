//! Error types for the Trellis control plane

use thiserror::Error;

/// Main error type for Trellis operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// File watch registration error
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// gRPC transport error
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Mesh configuration error
    #[error("mesh configuration error: {0}")]
    Mesh(String),

    /// Config store / config controller error
    #[error("config error: {0}")]
    Config(String),

    /// Service registry error
    #[error("registry error: {0}")]
    Registry(String),

    /// TLS material loading or validation error
    #[error("tls error: {0}")]
    Tls(String),

    /// Certificate authority error
    #[error("pki error: {0}")]
    Pki(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Data-plane proxy run failure
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Operation cancelled by shutdown
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Create a mesh configuration error with the given message
    pub fn mesh(msg: impl Into<String>) -> Self {
        Self::Mesh(msg.into())
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a registry error with the given message
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    /// Create a TLS error with the given message
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a PKI error with the given message
    pub fn pki(msg: impl Into<String>) -> Self {
        Self::Pki(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a proxy error with the given message
    pub fn proxy(msg: impl Into<String>) -> Self {
        Self::Proxy(msg.into())
    }

    /// Create a cancellation error with the given message
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_constructors_categorize() {
        match Error::mesh("bad yaml") {
            Error::Mesh(msg) => assert_eq!(msg, "bad yaml"),
            _ => panic!("expected Mesh variant"),
        }
        match Error::registry("duplicate") {
            Error::Registry(msg) => assert_eq!(msg, "duplicate"),
            _ => panic!("expected Registry variant"),
        }
    }

    #[test]
    fn display_includes_category_and_message() {
        let err = Error::config("source url fs:// contains no path");
        assert!(err.to_string().contains("config error"));
        assert!(err.to_string().contains("no path"));

        let err = Error::proxy("signal: killed");
        assert!(err.to_string().contains("proxy error"));
    }

    #[test]
    fn serde_errors_convert() {
        let yaml_err = serde_yaml::from_str::<usize>("not-a-number").unwrap_err();
        let err: Error = yaml_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("Cluster config inference error: {0}")]
    InferConfig(#[from] kube::config::InferConfigError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("exec command failed on container {container} in pod {pod} :: {message}")]
    Exec {
        pod: String,
        container: String,
        message: String,
    },

    #[error("exec operation took too long on container {container} in pod {pod}")]
    ExecTimeout { pod: String, container: String },

    #[error("{0} hasn't reached the expected state within the retry budget")]
    WaitTimeout(String),

    #[error("{0}")]
    Check(String),

    #[error("deletion of some resources failed in cleanup process: {}", failed.join(", "))]
    Cleanup { failed: Vec<String> },
}

/// Short alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn check(msg: impl Into<String>) -> Self {
        Self::Check(msg.into())
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// True when the API server answered 404 for the request.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(resp)) if resp.code == 404)
    }
}

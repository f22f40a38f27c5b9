use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed local configuration, raised before any remote call.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid {what}: {reason}")]
    InvalidSpec { what: String, reason: String },

    /// The service diagnostic, verbatim.
    #[error("image build failed: {0}")]
    RemoteBuild(String),

    #[error("could not acquire an instance of {alias}: {reason}")]
    InstanceAcquisition { alias: String, reason: String },

    /// A call against a running instance failed before producing an exit code.
    #[error("sandbox service error: {0}")]
    Remote(String),

    #[error("could not tear down instance {instance}: {reason}")]
    Teardown { instance: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("template file error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid<W: Into<String>, R: Into<String>>(what: W, reason: R) -> Error {
        Error::InvalidSpec {
            what: what.into(),
            reason: reason.into(),
        }
    }
}

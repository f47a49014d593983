use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to start probe: {0}")]
    StartFailed(String),
    #[error("failed to stop probe: {0}")]
    StopFailed(String),
    #[error("subscription rejected for {event}/{category}: {reason}")]
    Subscribe {
        event: String,
        category: String,
        reason: String,
    },
    #[error("probe error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(String),
    #[error("failed to parse config file: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("stored value for `{0}` has an unexpected type")]
    WrongType(String),
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor read failed: {0}")]
    Read(String),
    #[error("sensor returned an implausible value: {0}")]
    OutOfRange(f32),
}

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("display init failed: {0}")]
    Init(String),
    #[error("display draw failed: {0}")]
    Draw(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("SSID is required")]
    MissingSsid,
    #[error("SSID must be at most 32 bytes")]
    SsidTooLong,
    #[error("password must be at most 64 bytes")]
    PasswordTooLong,
    #[error("request body too large ({0} bytes)")]
    BodyTooLarge(usize),
    #[error("invalid form body: {0}")]
    InvalidForm(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProvisioningError {
    /// HTTP status the provisioning server answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingSsid
            | Self::SsidTooLong
            | Self::PasswordTooLong
            | Self::InvalidForm(_) => 400,
            Self::BodyTooLarge(_) => 413,
            Self::Store(_) => 500,
        }
    }
}

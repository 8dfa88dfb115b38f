/// Errors raised at the warehouse boundary. Everything above the boundary
/// works with `anyhow` and adds context on the way up.
#[derive(thiserror::Error, Debug)]
pub enum WarehouseError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("warehouse returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("job failed: {0}")]
    Job(String),
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("table not found: {0}")]
    NotFound(String),
}

impl From<gcp_auth::Error> for WarehouseError {
    fn from(err: gcp_auth::Error) -> Self {
        WarehouseError::Auth(err.to_string())
    }
}

impl From<serde_json::Error> for WarehouseError {
    fn from(err: serde_json::Error) -> Self {
        WarehouseError::Decode(err.to_string())
    }
}

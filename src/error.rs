use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Globus error: {0}")]
    Globus(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no project transfer request")]
    NoProjectTransferRequest,

    #[error("no access to project")]
    NoAccessToProject,

    #[error("no globus account configured")]
    NoGlobusAccount,

    #[error("Mount error: {0}")]
    Mount(String),
}

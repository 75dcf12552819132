use thiserror::Error;

pub type Result<T> = std::result::Result<T, SeedError>;

#[derive(Debug, Error)]
pub enum SeedError {
    /// The requested object is absent from the backend. Every backend
    /// normalizes its own notion of "no such key" to this sentinel.
    #[error("not exist")]
    NotExist,

    #[error("data too big, fetch by chunks")]
    DataTooBig,

    #[error("allow max item size is 100 MB")]
    ItemTooLarge,

    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),

    #[error("order already paid for item {0}")]
    OrderAlreadyPaid(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SeedError {
    pub fn is_not_exist(&self) -> bool {
        matches!(self, SeedError::NotExist)
    }
}

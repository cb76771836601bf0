/// Core error type for the quota gate.
///
/// Adapter crates should map their specific errors into this type. The quota
/// operations themselves never return it: storage faults are recovered inside
/// the store and only surface through logging.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {key}: {reason}")]
    Storage { key: String, reason: String },

    #[error("external error: {0}")]
    External(String),
}


pub type Result<T> = std::result::Result<T, Error>;

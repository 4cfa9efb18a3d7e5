#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation Error: {0} should be {1}")]
    Validation(String, String),

    #[error("Unsupported Error: {0}")]
    Unsupported(String),

    #[error("Collective Error: {0}")]
    Collective(String),

    #[error("Parse Error: {0}")]
    ParseInt(#[from] std::num::ParseIntError),
}

use thiserror::Error;

/// Errors that can occur when talking to a chain node over JSON-RPC.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid endpoint URL: {0}")]
    InvalidEndpoint(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("node returned http status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("rpc error {code} from `{method}`: {message}")]
    Rpc {
        method: &'static str,
        code: i64,
        message: String,
    },
    #[error("`{0}` returned a null result")]
    MissingResult(&'static str),
    #[error("parse error: {0}")]
    Parse(String),
}

impl ChainError {
    pub(crate) fn parse_error(msg: impl Into<String>) -> Self {
        ChainError::Parse(msg.into())
    }
}

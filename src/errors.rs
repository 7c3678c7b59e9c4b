pub use log::{debug, error, info, trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    ReqwestMiddleware(#[from] reqwest_middleware::Error),
    #[error(transparent)]
    Tempfile(#[from] async_tempfile::Error),
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),
    #[error(transparent)]
    XmlAttr(#[from] quick_xml::events::attributes::AttrError),
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),
    #[error(transparent)]
    ParseInt(#[from] std::num::ParseIntError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    JoinError(#[from] tokio::task::JoinError),
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unsupported checksum type: {0}, only sha256 is supported")]
    UnsupportedChecksum(String),
    #[error("checksum mismatch for {path}: expected {expected}, found {found}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        found: String,
    },
    #[error("invalid snapshot id: {0:?}")]
    InvalidSnapshotId(String),
    #[error("directory not found: {0}")]
    DirectoryNotFound(String),
    #[error("http error: {status} for {url}")]
    Http { status: u16, url: String },
    #[error("malformed upstream metadata: {0}")]
    UpstreamFormat(String),
    #[error("child process exited with error: {0}")]
    ChildExit(std::process::ExitStatus),
    #[error("s3 presign error")]
    S3PresignError,
    #[error("repomd.xml is missing a `{0}` data entry")]
    MissingSection(String),
    #[error("{0} repositories failed to sync")]
    SyncFailed(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

use std::fmt;

/// Error type for all kernel link and namespace operations
#[derive(Debug)]
pub enum LinkError {
    /// Netlink operation failed
    Netlink(rtnetlink::Error),
    /// System I/O error
    Io(std::io::Error),
    /// Resource not found (link, bridge, peer, etc.)
    NotFound(String),
    /// Resource already exists
    AlreadyExists(String),
    /// Namespace operation failed
    Namespace(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Netlink(e) => write!(f, "netlink error: {}", e),
            LinkError::Io(e) => write!(f, "io error: {}", e),
            LinkError::NotFound(msg) => write!(f, "not found: {}", msg),
            LinkError::AlreadyExists(msg) => write!(f, "already exists: {}", msg),
            LinkError::Namespace(msg) => write!(f, "namespace error: {}", msg),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<rtnetlink::Error> for LinkError {
    fn from(e: rtnetlink::Error) -> Self {
        LinkError::Netlink(e)
    }
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        LinkError::Io(e)
    }
}

pub type LinkResult<T> = Result<T, LinkError>;

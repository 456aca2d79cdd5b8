pub type Result<T> = std::result::Result<T, Error>;

/// Builds an [`Error`] from a kind and an optional formatted message.
///
/// ```ignore
/// return Err(error!(Timeout => "no free connection after {}s", secs));
/// ```
#[macro_export]
macro_rules! error {
    ($kind:ident) => {
        $crate::error::Error {
            kind: $crate::error::ErrorKind::$kind,
            message: None,
        }
    };
    ($kind:ident => $($arg:tt)*) => {
        $crate::error::Error {
            kind: $crate::error::ErrorKind::$kind,
            message: Some(format!($($arg)*)),
        }
    };
}

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Name, zone or entry does not exist.
    NotFound,
    /// Attempted to create something that is already live.
    Exists,
    /// Malformed master-file or directory escape sequence.
    BadEscape,
    /// DN owner is not subordinate to its zone, or names the zone apex.
    BadOwnerName,
    /// Valid input the engine does not handle (mixed TTLs, multi-valued
    /// RDNs, unsupported address family).
    NotImplemented,
    /// Credentials rejected, or the target zone forbids the mutation.
    NoPerm,
    /// Directory server unreachable or credentials unavailable.
    NotConnected,
    /// Directory or pool wait exceeded its deadline.
    Timeout,
    /// Invalid forwarder, ACL element or PTR target.
    UnexpectedToken,
    /// A conflicting PTR record already exists.
    Singleton,
    /// The instance is shutting down.
    Shutdown,
    /// Reconnect attempted before the backoff window elapsed.
    SoftQuota,
    /// The zone database has no loaded version to work against.
    NotLoaded,
    /// The zone database rejected the transaction.
    BadZone,
    Io,
    DomainStr,
    ZoneFormat,
    Config,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            message: None,
        }
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// True for errors that mean the directory link itself is gone and a
    /// reconnect is in order.
    pub fn is_connection(&self) -> bool {
        matches!(self.kind, ErrorKind::NotConnected | ErrorKind::Timeout)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.kind, message),
            None => self.kind.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ErrorKind::*;

        match self {
            NotFound => write!(f, "not found"),
            Exists => write!(f, "already exists"),
            BadEscape => write!(f, "malformed escape"),
            BadOwnerName => write!(f, "bad owner name"),
            NotImplemented => write!(f, "not implemented"),
            NoPerm => write!(f, "permission denied"),
            NotConnected => write!(f, "not connected"),
            Timeout => write!(f, "timed out"),
            UnexpectedToken => write!(f, "unexpected token"),
            Singleton => write!(f, "conflicting singleton record"),
            Shutdown => write!(f, "shutting down"),
            SoftQuota => write!(f, "backoff window not elapsed"),
            NotLoaded => write!(f, "zone not loaded"),
            BadZone => write!(f, "bad zone data"),
            Io => write!(f, "io error"),
            DomainStr => write!(f, "invalid domain name"),
            ZoneFormat => write!(f, "invalid record data"),
            Config => write!(f, "configuration error"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Io,
            message: Some(value.to_string()),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(value: serde_yaml::Error) -> Self {
        Self {
            kind: ErrorKind::Config,
            message: Some(value.to_string()),
        }
    }
}

impl From<domain::base::name::FromStrError> for Error {
    fn from(value: domain::base::name::FromStrError) -> Self {
        Self {
            kind: ErrorKind::DomainStr,
            message: Some(value.to_string()),
        }
    }
}

impl From<domain::base::name::PushNameError> for Error {
    fn from(value: domain::base::name::PushNameError) -> Self {
        Self {
            kind: ErrorKind::DomainStr,
            message: Some(value.to_string()),
        }
    }
}

impl From<domain::zonefile::inplace::Error> for Error {
    fn from(value: domain::zonefile::inplace::Error) -> Self {
        Self {
            kind: ErrorKind::ZoneFormat,
            message: Some(value.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macro_forms() {
        let e = error!(Timeout);
        assert!(e.is(ErrorKind::Timeout));
        assert!(e.message.is_none());

        let e = error!(NoPerm => "zone {} refuses updates", "example.org.");
        assert!(e.is(ErrorKind::NoPerm));
        assert_eq!(
            e.to_string(),
            "permission denied: zone example.org. refuses updates"
        );
    }
}

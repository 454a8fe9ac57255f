use thiserror::Error;

/// Errors surfaced to refine callers.
///
/// Daemon failures are translated into this taxonomy exactly once, in
/// [`crate::client::QueryClient`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefineError {
    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("no network: {0}")]
    NoNetwork(String),

    #[error("no security: {0}")]
    NoSecurity(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("no space: {0}")]
    NoSpace(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("failed: {0}")]
    Failed(String),
}

impl RefineError {
    pub fn cancelled() -> Self {
        RefineError::Cancelled("operation was cancelled".to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RefineError::Cancelled(_))
    }

    pub fn message(&self) -> &str {
        match self {
            RefineError::NotSupported(m)
            | RefineError::NoNetwork(m)
            | RefineError::NoSecurity(m)
            | RefineError::Cancelled(m)
            | RefineError::NoSpace(m)
            | RefineError::InvalidFormat(m)
            | RefineError::DownloadFailed(m)
            | RefineError::Failed(m) => m,
        }
    }

    /// Prepends `context` to the message, keeping the kind.
    pub fn prefixed(self, context: &str) -> Self {
        let wrap = |m: String| format!("{context}: {m}");
        match self {
            RefineError::NotSupported(m) => RefineError::NotSupported(wrap(m)),
            RefineError::NoNetwork(m) => RefineError::NoNetwork(wrap(m)),
            RefineError::NoSecurity(m) => RefineError::NoSecurity(wrap(m)),
            RefineError::Cancelled(m) => RefineError::Cancelled(wrap(m)),
            RefineError::NoSpace(m) => RefineError::NoSpace(wrap(m)),
            RefineError::InvalidFormat(m) => RefineError::InvalidFormat(wrap(m)),
            RefineError::DownloadFailed(m) => RefineError::DownloadFailed(wrap(m)),
            RefineError::Failed(m) => RefineError::Failed(wrap(m)),
        }
    }
}

/// Raw error codes reported by the daemon transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaemonErrorCode {
    // client side
    CannotStartDaemon,
    InvalidFile,
    NotSupported,
    /// The daemon does not know the method; it is too old.
    UnknownMethod,
    TimedOut,
    Cancelled,
    Failed,

    // backend side
    /// The single exclusive transaction slot is occupied.
    Busy,
    NoNetwork,
    NoCache,
    PackageDownloadFailed,
    NoMoreMirrors,
    CannotFetchSources,
    BadGpgSignature,
    GpgFailure,
    MissingGpgSignature,
    RepoUnsigned,
    NotAuthorized,
    NoLicenseAgreement,
    RestrictedDownload,
    NoSpaceOnDevice,
    InvalidPackageFile,
    PackageInstallBlocked,
    TransactionCancelled,
    CancelledPriority,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code:?}: {details}")]
pub struct DaemonError {
    pub code: DaemonErrorCode,
    pub details: String,
}

impl DaemonError {
    pub fn new(code: DaemonErrorCode, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
        }
    }

    pub fn busy() -> Self {
        Self::new(DaemonErrorCode::Busy, "transaction slot in use")
    }

    pub fn is_busy(&self) -> bool {
        self.code == DaemonErrorCode::Busy
    }
}

/// Maps a daemon error onto the caller taxonomy, prefixing `context`.
pub(crate) fn translate(err: DaemonError, context: &str) -> RefineError {
    use DaemonErrorCode::*;

    let msg = format!("{context}: {}", err.details);
    match err.code {
        CannotStartDaemon | InvalidFile | NotSupported | UnknownMethod | InvalidPackageFile
        | PackageInstallBlocked => RefineError::NotSupported(msg),
        NoNetwork | NoCache => RefineError::NoNetwork(msg),
        PackageDownloadFailed | NoMoreMirrors | CannotFetchSources => {
            RefineError::DownloadFailed(msg)
        }
        BadGpgSignature | GpgFailure | MissingGpgSignature | RepoUnsigned | NotAuthorized
        | NoLicenseAgreement | RestrictedDownload => RefineError::NoSecurity(msg),
        NoSpaceOnDevice => RefineError::NoSpace(msg),
        Cancelled | TransactionCancelled | CancelledPriority => RefineError::Cancelled(msg),
        TimedOut | Failed | Busy | Other => RefineError::Failed(msg),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    #[error("refiner '{0}' is ordered relative to itself")]
    SelfReference(String),

    #[error("ordering rules form a cycle through: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("refiner '{0}' registered twice")]
    Duplicate(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_table() {
        let cases = [
            (DaemonErrorCode::CannotStartDaemon, "not supported"),
            (DaemonErrorCode::UnknownMethod, "not supported"),
            (DaemonErrorCode::PackageInstallBlocked, "not supported"),
            (DaemonErrorCode::NoCache, "no network"),
            (DaemonErrorCode::NoMoreMirrors, "download failed"),
            (DaemonErrorCode::MissingGpgSignature, "no security"),
            (DaemonErrorCode::NotAuthorized, "no security"),
            (DaemonErrorCode::NoSpaceOnDevice, "no space"),
            (DaemonErrorCode::CancelledPriority, "cancelled"),
            (DaemonErrorCode::Other, "failed"),
        ];
        for (code, expected) in cases {
            let err = translate(DaemonError::new(code, "boom"), "failed to resolve");
            assert!(
                err.to_string().starts_with(expected),
                "{code:?} translated to {err}"
            );
            assert_eq!(err.message(), "failed to resolve: boom");
        }
    }

    #[test]
    fn test_leaked_busy_is_generic_failure() {
        let err = translate(DaemonError::busy(), "failed to get details");
        assert!(matches!(err, RefineError::Failed(_)));
    }

    #[test]
    fn test_prefixed_keeps_kind() {
        let err = RefineError::NoSpace("disk full".to_string()).prefixed("install");
        assert_eq!(err, RefineError::NoSpace("install: disk full".to_string()));
    }
}

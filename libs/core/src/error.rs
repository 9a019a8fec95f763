use thiserror::Error;

/// Failure taxonomy surfaced by every public operation.
///
/// Adapter- and store-level errors never escape raw: callers always see one
/// of these kinds, each with a stable machine code for API clients.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transport backend unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("no active session for tenant {0}")]
    NotPaired(String),
    #[error("pairing artifact expired")]
    PairingExpired,
    #[error("send failed (transient): {0}")]
    SendFailedTransient(String),
    #[error("send failed after {attempts} attempts: {message}")]
    SendFailedTerminal { attempts: u32, message: String },
    #[error("reminder already sent for {0}")]
    DuplicateSuppressed(String),
    #[error("no active {kind} template for tenant {tenant}")]
    TemplateMissing { tenant: String, kind: &'static str },
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl CoreError {
    /// Stable machine-readable code for API payloads and logs.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::AdapterUnavailable(_) => "E_ADAPTER_UNAVAILABLE",
            CoreError::InvalidRecipient(_) => "E_INVALID_RECIPIENT",
            CoreError::NotPaired(_) => "E_NOT_PAIRED",
            CoreError::PairingExpired => "E_PAIRING_EXPIRED",
            CoreError::SendFailedTransient(_) => "E_SEND_TRANSIENT",
            CoreError::SendFailedTerminal { .. } => "E_SEND_TERMINAL",
            CoreError::DuplicateSuppressed(_) => "E_DUPLICATE_SUPPRESSED",
            CoreError::TemplateMissing { .. } => "E_TEMPLATE_MISSING",
            CoreError::Store(_) => "E_STORE",
        }
    }

    /// Whether the dispatcher may retry the operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::AdapterUnavailable(_) | CoreError::SendFailedTransient(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            CoreError::InvalidRecipient("x".into()).code(),
            "E_INVALID_RECIPIENT"
        );
        assert_eq!(CoreError::NotPaired("t".into()).code(), "E_NOT_PAIRED");
        assert_eq!(
            CoreError::DuplicateSuppressed("apt-1".into()).code(),
            "E_DUPLICATE_SUPPRESSED"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(CoreError::AdapterUnavailable("down".into()).is_transient());
        assert!(CoreError::SendFailedTransient("429".into()).is_transient());
        assert!(!CoreError::InvalidRecipient("abc".into()).is_transient());
        assert!(!CoreError::NotPaired("t".into()).is_transient());
    }
}

use std::future::Future;

use thiserror::Error;

use crate::journaling::Entry;

/// Failure of a call to the remote entry store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Network failure, timeout or server error.
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    /// The server refused the request.
    #[error("remote rejected the request: {0}")]
    Rejected(String),
    /// Credentials are no longer accepted; the session needs to re-authenticate.
    #[error("authentication expired: {0}")]
    AuthExpired(String),
}

impl RemoteError {
    /// Classifies an HTTP-style status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => Self::AuthExpired(message),
            400..=499 => Self::Rejected(message),
            _ => Self::Unavailable(message),
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired(_))
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// The authoritative server copy of today's entry.
pub trait RemoteEntryGateway: Send + Sync + 'static {
    /// `Ok(None)` means nothing has been stored for today yet.
    fn fetch_today(&self) -> impl Future<Output = RemoteResult<Option<Entry>>> + Send;

    /// Stores today's entry and returns the server's canonical copy.
    fn push_today(
        &self,
        rating: u8,
        text: &str,
        ephemeral: bool,
    ) -> impl Future<Output = RemoteResult<Entry>> + Send;
}

/// Gateway for sessions without a network transport: every call is unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineGateway;

impl RemoteEntryGateway for OfflineGateway {
    async fn fetch_today(&self) -> RemoteResult<Option<Entry>> {
        Err(RemoteError::Unavailable("offline".into()))
    }

    async fn push_today(&self, _rating: u8, _text: &str, _ephemeral: bool) -> RemoteResult<Entry> {
        Err(RemoteError::Unavailable("offline".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn status_codes_map_onto_the_taxonomy() {
        assert_matches!(RemoteError::from_status(401, "expired"), RemoteError::AuthExpired(_));
        assert_matches!(RemoteError::from_status(422, "bad rating"), RemoteError::Rejected(_));
        assert_matches!(RemoteError::from_status(503, "down"), RemoteError::Unavailable(_));
        assert_matches!(RemoteError::from_status(0, "no response"), RemoteError::Unavailable(_));
    }

    #[test]
    fn only_unauthorized_means_expired_credentials() {
        assert!(RemoteError::AuthExpired("x".into()).is_auth_expired());
        assert!(!RemoteError::Rejected("x".into()).is_auth_expired());
        assert!(!RemoteError::from_status(403, "forbidden").is_auth_expired());
    }

    #[tokio::test]
    async fn offline_gateway_is_always_unavailable() {
        let gateway = OfflineGateway;
        assert_matches!(gateway.fetch_today().await, Err(RemoteError::Unavailable(_)));
        assert_matches!(
            gateway.push_today(7, "text", false).await,
            Err(RemoteError::Unavailable(_))
        );
    }
}

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 32;

/// Notification emitted whenever the cached tokens change
#[derive(Clone, PartialEq, Eq)]
pub enum TokenEvent {
    /// Current bearer string, empty once signed out
    AccessTokenChanged(String),
    /// Expiry of the current access token, `None` once signed out
    ExpirationChanged(Option<DateTime<Utc>>),
}

impl TokenEvent {
    pub fn is_signed_out(&self) -> bool {
        match self {
            Self::AccessTokenChanged(token) => token.is_empty(),
            Self::ExpirationChanged(expiry) => expiry.is_none(),
        }
    }
}

impl std::fmt::Debug for TokenEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AccessTokenChanged(token) if token.is_empty() => {
                f.write_str("AccessTokenChanged(<empty>)")
            }
            Self::AccessTokenChanged(_) => f.write_str("AccessTokenChanged([REDACTED])"),
            Self::ExpirationChanged(expiry) => {
                f.debug_tuple("ExpirationChanged").field(expiry).finish()
            }
        }
    }
}

/// Fan-out of token notifications to any number of subscribers
///
/// Dropping a receiver unsubscribes it. Slow receivers may observe
/// `RecvError::Lagged` and should re-read the current token.
#[derive(Debug, Clone)]
pub struct TokenEvents {
    sender: broadcast::Sender<TokenEvent>,
}

impl TokenEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Announce a newly cached token and its expiry
    pub fn token_stored(&self, bearer: String, expires_at: DateTime<Utc>) {
        self.publish(TokenEvent::AccessTokenChanged(bearer));
        self.publish(TokenEvent::ExpirationChanged(Some(expires_at)));
    }

    /// Announce that no token is cached anymore
    pub fn token_cleared(&self) {
        self.publish(TokenEvent::AccessTokenChanged(String::new()));
        self.publish(TokenEvent::ExpirationChanged(None));
    }

    /// Forward an event received from elsewhere, e.g. over IPC
    pub fn publish(&self, event: TokenEvent) {
        // No subscribers is fine
        if self.sender.send(event).is_err() {
            trace!("No token event subscribers");
        }
    }
}

impl Default for TokenEvents {
    fn default() -> Self {
        Self::new()
    }
}

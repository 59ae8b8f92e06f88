//! Client configuration.

use std::time::Duration;

/// Environment variable read by [`ClientConfig::from_env`].
pub const URL_ENV_VAR: &str = "QUIZ_BATTLE_URL";

/// Server URL used when none is configured.
pub const DEFAULT_URL: &str = "ws://localhost:5000/socket";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_ANSWER_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_MESSAGE_CHARS: usize = 200;
const DEFAULT_CHAT_DEDUP_WINDOW: Duration = Duration::from_millis(1000);

/// Configuration shared by the connection manager, room controller and
/// battle session.
///
/// # Example
///
/// ```
/// use quiz_battle_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::new("ws://localhost:5000/socket")
///     .with_reconnect_attempts(3)
///     .with_join_timeout(Duration::from_secs(2));
/// assert_eq!(config.reconnect_attempts, 3);
/// assert_eq!(config.connect_timeout, Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Socket endpoint.
    pub url: String,
    /// Deadline for the initial handshake. Defaults to **10 seconds**.
    pub connect_timeout: Duration,
    /// Re-dial attempts after an established connection drops.
    /// Defaults to **5**; zero disables reconnection.
    pub reconnect_attempts: u32,
    /// Fixed delay between re-dial attempts. Defaults to **1 second**.
    pub reconnect_delay: Duration,
    /// Deadline for a `join_room` acknowledgement. Defaults to **5 seconds**.
    pub join_timeout: Duration,
    /// Deadline for an `answer_recorded` reply. Defaults to **5 seconds**.
    pub answer_timeout: Duration,
    /// Time given to the transport loop to close gracefully.
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Longest chat message accepted at the input boundary, in characters.
    pub max_message_chars: usize,
    /// Window within which identical chat entries count as duplicates.
    pub chat_dedup_window: Duration,
}

impl ClientConfig {
    /// Create a configuration for `url` with default values.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            answer_timeout: DEFAULT_ANSWER_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            chat_dedup_window: DEFAULT_CHAT_DEDUP_WINDOW,
        }
    }

    /// Read the URL from `QUIZ_BATTLE_URL`, falling back to [`DEFAULT_URL`].
    pub fn from_env() -> Self {
        let url = std::env::var(URL_ENV_VAR).unwrap_or_else(|_| DEFAULT_URL.to_string());
        Self::new(url)
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    #[must_use]
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_answer_timeout(mut self, timeout: Duration) -> Self {
        self.answer_timeout = timeout;
        self
    }

    /// A zero timeout aborts the transport loop without a graceful close.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_max_message_chars(mut self, chars: usize) -> Self {
        self.max_message_chars = chars.max(1);
        self
    }

    #[must_use]
    pub fn with_chat_dedup_window(mut self, window: Duration) -> Self {
        self.chat_dedup_window = window;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_URL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ClientConfig::new("ws://example.test/socket");
        assert_eq!(config.url, "ws://example.test/socket");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.join_timeout, Duration::from_secs(5));
        assert_eq!(config.answer_timeout, Duration::from_secs(5));
        assert_eq!(config.max_message_chars, 200);
        assert_eq!(config.chat_dedup_window, Duration::from_millis(1000));
    }

    #[test]
    fn config_builder_methods() {
        let config = ClientConfig::default()
            .with_connect_timeout(Duration::from_secs(2))
            .with_reconnect_delay(Duration::from_millis(250))
            .with_answer_timeout(Duration::from_secs(3))
            .with_shutdown_timeout(Duration::ZERO);
        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.answer_timeout, Duration::from_secs(3));
        assert_eq!(config.shutdown_timeout, Duration::ZERO);
    }

    #[test]
    fn max_message_chars_is_clamped_to_one() {
        let config = ClientConfig::default().with_max_message_chars(0);
        assert_eq!(config.max_message_chars, 1);
    }
}

/// Application name
pub const APP_NAME: &str = "Courier";

/// File name of the local database inside the platform data directory
pub const DATABASE_FILE: &str = "courier.db";

/// How long a typing indicator stays valid without a refresh (5 s)
pub const DEFAULT_TYPING_TTL_MS: u64 = 5_000;

/// Upper bound for a single remote fetch or write (10 s)
pub const DEFAULT_NETWORK_TIMEOUT_MS: u64 = 10_000;

/// Replay attempts before a queued operation is abandoned
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// First backoff delay between replay attempts (1 s)
pub const DEFAULT_RETRY_BASE_MS: u64 = 1_000;

/// Backoff ceiling (5 min)
pub const DEFAULT_RETRY_MAX_MS: u64 = 300_000;

/// Fraction of the backoff delay added as random jitter
pub const DEFAULT_RETRY_JITTER: f64 = 0.1;

/// Remote collection roots
pub const REMOTE_CHATS: &str = "chats";
pub const REMOTE_MESSAGES: &str = "messages";
pub const REMOTE_TYPING: &str = "typing";
pub const REMOTE_USERS: &str = "users";

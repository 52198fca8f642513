use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current time truncated to millisecond precision, which is the precision
/// every persisted and remote timestamp is stored with.
pub fn timestamp_now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionQuality {
    #[default]
    Offline,
    Poor,
    Good,
    Excellent,
}

/// Process-wide connectivity snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub online: bool,
    pub quality: ConnectionQuality,
}

impl ConnectivityState {
    pub fn offline() -> Self {
        Self {
            online: false,
            quality: ConnectionQuality::Offline,
        }
    }

    /// An online state. `Offline` quality is bumped to `Poor` so the two
    /// fields never contradict each other.
    pub fn online(quality: ConnectionQuality) -> Self {
        let quality = match quality {
            ConnectionQuality::Offline => ConnectionQuality::Poor,
            other => other,
        };
        Self {
            online: true,
            quality,
        }
    }
}

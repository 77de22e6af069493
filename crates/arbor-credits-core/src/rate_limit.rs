//! Rate-limit records for arbor-credits.
//!
//! One record per attempted generation request. Records are ephemeral:
//! the limiter only reads the trailing window, and a background sweep
//! purges anything older than the retention horizon.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// A single recorded request attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRecord {
    /// The user who made the attempt.
    pub user_id: UserId,

    /// When the attempt was made.
    pub attempted_at: DateTime<Utc>,
}

impl RateLimitRecord {
    /// Create a record stamped with the current time.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            attempted_at: Utc::now(),
        }
    }
}

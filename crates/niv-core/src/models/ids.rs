use chrono::Utc;
use parking_lot::{Mutex, const_mutex};

/// Hands out millisecond timestamps that never repeat and never go backwards,
/// even when the wall clock stalls or is adjusted.
pub struct IdGenerator {
    last: Mutex<i64>,
}

static IDS: IdGenerator = IdGenerator::new();

impl IdGenerator {
    pub const fn new() -> Self {
        Self {
            last: const_mutex(0),
        }
    }

    /// Reserve `count` consecutive ids and return the first one.
    pub fn reserve(&self, count: i64) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last.lock();
        let base = if now > *last { now } else { *last + 1 };
        *last = base + count.max(1) - 1;
        base
    }

    pub fn next(&self) -> i64 {
        self.reserve(1)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Next process-wide id, as used for conversations.
pub fn next_id() -> String {
    IDS.next().to_string()
}

/// Ids for a user prompt and the assistant reply that follows it (`base`, `base + 1`).
pub fn next_message_pair() -> (String, String) {
    let base = IDS.reserve(2);
    (base.to_string(), (base + 1).to_string())
}

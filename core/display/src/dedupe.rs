//! Which alerts this display has already shown.
//!
//! Lives for the whole display session and is never cleared on reconnect.

use playtime_daemon_protocol::AlertTier;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct AlertLedger {
    shown: HashMap<String, AlertTier>,
    expired: HashSet<String>,
}

impl AlertLedger {
    /// Records `tier` for `timer_id` and returns whether it should be shown,
    /// i.e. it is more severe than anything shown for that timer so far.
    pub fn observe_tier(&mut self, timer_id: &str, tier: AlertTier) -> bool {
        let previous = self.shown.get(timer_id).copied();
        if !tier.is_more_severe_than(previous) {
            return false;
        }
        self.shown.insert(timer_id.to_string(), tier);
        true
    }

    /// True the first time a timer's expiry is seen.
    pub fn observe_expiry(&mut self, timer_id: &str) -> bool {
        self.expired.insert(timer_id.to_string())
    }

    pub fn shown_tier(&self, timer_id: &str) -> Option<AlertTier> {
        self.shown.get(timer_id).copied()
    }
}

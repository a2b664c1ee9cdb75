//! Local view of the daemon's timers.
//!
//! The last `timers_update` is authoritative for what is on screen; alerts and
//! expiries only decide what gets announced, filtered through `AlertLedger`.

use playtime_daemon_protocol::{AlertTier, ServerMessage, TimerStatus, TimerView};
use std::collections::BTreeMap;

use crate::dedupe::AlertLedger;
use crate::socket::SocketState;

pub const RECONNECTING_INDICATOR: &str = "disconnected / reconnecting";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Alert {
        timer_id: String,
        child_name: String,
        tier: AlertTier,
        remaining_minutes: i64,
    },
    Expired {
        timer_id: String,
        child_name: String,
    },
}

#[derive(Debug)]
pub struct DisplayState {
    timers: BTreeMap<String, TimerView>,
    ledger: AlertLedger,
    connection: SocketState,
}

impl Default for DisplayState {
    fn default() -> Self {
        Self {
            timers: BTreeMap::new(),
            ledger: AlertLedger::default(),
            connection: SocketState::Disconnected,
        }
    }
}

impl DisplayState {
    pub fn apply(&mut self, message: ServerMessage) -> Vec<Notification> {
        match message {
            ServerMessage::TimersUpdate { timers } => self.apply_snapshot(timers),
            ServerMessage::TimerAlert {
                timer_id,
                tier,
                remaining_minutes,
                child_name,
            } => {
                if let Some(view) = self.timers.get_mut(&timer_id) {
                    if tier.is_more_severe_than(view.alert_tier) {
                        view.alert_tier = Some(tier);
                    }
                    view.status = view.status.max(TimerStatus::Alert);
                }
                if !self.ledger.observe_tier(&timer_id, tier) {
                    return Vec::new();
                }
                vec![Notification::Alert {
                    timer_id,
                    child_name,
                    tier,
                    remaining_minutes,
                }]
            }
            ServerMessage::TimerExpired {
                timer_id,
                child_name,
            } => {
                if let Some(view) = self.timers.get_mut(&timer_id) {
                    view.status = TimerStatus::Expired;
                    view.remaining_seconds = 0;
                }
                if !self.ledger.observe_expiry(&timer_id) {
                    return Vec::new();
                }
                vec![Notification::Expired {
                    timer_id,
                    child_name,
                }]
            }
        }
    }

    fn apply_snapshot(&mut self, timers: Vec<TimerView>) -> Vec<Notification> {
        let mut notifications = Vec::new();
        for view in &timers {
            if view.status == TimerStatus::Expired {
                if self.ledger.observe_expiry(&view.id) {
                    notifications.push(Notification::Expired {
                        timer_id: view.id.clone(),
                        child_name: view.child_name.clone(),
                    });
                }
                continue;
            }
            if let Some(tier) = view.alert_tier {
                if self.ledger.observe_tier(&view.id, tier) {
                    notifications.push(Notification::Alert {
                        timer_id: view.id.clone(),
                        child_name: view.child_name.clone(),
                        tier,
                        remaining_minutes: minutes_ceil(view.remaining_seconds),
                    });
                }
            }
        }
        self.timers = timers
            .into_iter()
            .map(|view| (view.id.clone(), view))
            .collect();
        notifications
    }

    pub fn set_connection(&mut self, state: SocketState) {
        self.connection = state;
    }

    pub fn connection(&self) -> SocketState {
        self.connection
    }

    /// Shown while the socket is anywhere but `connected`.
    pub fn indicator(&self) -> Option<&'static str> {
        match self.connection {
            SocketState::Connected => None,
            SocketState::Connecting | SocketState::Disconnected => Some(RECONNECTING_INDICATOR),
        }
    }

    pub fn timers(&self) -> impl Iterator<Item = &TimerView> {
        self.timers.values()
    }

    pub fn timer(&self, timer_id: &str) -> Option<&TimerView> {
        self.timers.get(timer_id)
    }
}

fn minutes_ceil(seconds: i64) -> i64 {
    if seconds <= 0 {
        return 0;
    }
    (seconds + 59) / 60
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(id: &str, remaining_seconds: i64, tier: Option<AlertTier>) -> TimerView {
        TimerView {
            id: id.to_string(),
            child_name: format!("child-{}", id),
            remaining_seconds,
            status: if tier.is_some() {
                TimerStatus::Alert
            } else {
                TimerStatus::Active
            },
            alert_tier: tier,
        }
    }

    fn alert(id: &str, tier: AlertTier, remaining_minutes: i64) -> ServerMessage {
        ServerMessage::TimerAlert {
            timer_id: id.to_string(),
            tier,
            remaining_minutes,
            child_name: format!("child-{}", id),
        }
    }

    #[test]
    fn alert_is_announced_once_per_tier() {
        let mut state = DisplayState::default();
        state.apply(ServerMessage::TimersUpdate {
            timers: vec![view("a", 16 * 60, None)],
        });

        assert_eq!(state.apply(alert("a", AlertTier::Fifteen, 15)).len(), 1);
        assert!(state.apply(alert("a", AlertTier::Fifteen, 15)).is_empty());
        assert_eq!(state.timer("a").and_then(|t| t.alert_tier), Some(AlertTier::Fifteen));
        assert_eq!(state.timer("a").map(|t| t.status), Some(TimerStatus::Alert));
    }

    #[test]
    fn snapshot_tier_already_announced_by_alert_is_not_repeated() {
        let mut state = DisplayState::default();
        assert_eq!(state.apply(alert("a", AlertTier::Ten, 10)).len(), 1);

        let notes = state.apply(ServerMessage::TimersUpdate {
            timers: vec![view("a", 9 * 60 + 30, Some(AlertTier::Ten))],
        });
        assert!(notes.is_empty());
    }

    #[test]
    fn late_less_severe_alert_is_ignored() {
        let mut state = DisplayState::default();
        state.apply(alert("a", AlertTier::Five, 5));
        assert!(state.apply(alert("a", AlertTier::Ten, 10)).is_empty());
    }

    #[test]
    fn reconnect_snapshot_is_authoritative_and_dedupe_survives() {
        let mut state = DisplayState::default();
        state.set_connection(SocketState::Connected);
        state.apply(ServerMessage::TimersUpdate {
            timers: vec![
                view("a", 16 * 60, None),
                view("b", 20 * 60, None),
                view("c", 30 * 60, None),
            ],
        });
        assert_eq!(state.apply(alert("a", AlertTier::Fifteen, 15)).len(), 1);

        // Outage: the daemon announces a->10, a->5 and c->15 while we are away.
        state.set_connection(SocketState::Disconnected);
        assert_eq!(state.indicator(), Some(RECONNECTING_INDICATOR));
        state.set_connection(SocketState::Connecting);
        assert_eq!(state.indicator(), Some(RECONNECTING_INDICATOR));
        state.set_connection(SocketState::Connected);
        assert_eq!(state.indicator(), None);

        let notes = state.apply(ServerMessage::TimersUpdate {
            timers: vec![
                view("a", 4 * 60 + 10, Some(AlertTier::Five)),
                view("c", 14 * 60, Some(AlertTier::Fifteen)),
            ],
        });

        assert_eq!(
            notes,
            vec![
                Notification::Alert {
                    timer_id: "a".to_string(),
                    child_name: "child-a".to_string(),
                    tier: AlertTier::Five,
                    remaining_minutes: 5,
                },
                Notification::Alert {
                    timer_id: "c".to_string(),
                    child_name: "child-c".to_string(),
                    tier: AlertTier::Fifteen,
                    remaining_minutes: 14,
                },
            ]
        );
        assert!(state.timer("b").is_none());
        assert_eq!(state.timer("a").map(|t| t.remaining_seconds), Some(250));
        assert_eq!(state.timers().count(), 2);

        // A delayed copy of the missed alert does not fire again.
        assert!(state.apply(alert("a", AlertTier::Ten, 10)).is_empty());
    }

    #[test]
    fn expiry_is_announced_once() {
        let mut state = DisplayState::default();
        state.apply(ServerMessage::TimersUpdate {
            timers: vec![view("a", 30, Some(AlertTier::Five))],
        });
        let expired = ServerMessage::TimerExpired {
            timer_id: "a".to_string(),
            child_name: "child-a".to_string(),
        };
        assert_eq!(state.apply(expired.clone()).len(), 1);
        assert!(state.apply(expired).is_empty());
        assert_eq!(state.timer("a").map(|t| t.status), Some(TimerStatus::Expired));
        assert_eq!(state.timer("a").map(|t| t.remaining_seconds), Some(0));
    }

    #[test]
    fn remaining_minutes_round_up() {
        assert_eq!(minutes_ceil(0), 0);
        assert_eq!(minutes_ceil(-5), 0);
        assert_eq!(minutes_ceil(1), 1);
        assert_eq!(minutes_ceil(60), 1);
        assert_eq!(minutes_ceil(61), 2);
    }
}

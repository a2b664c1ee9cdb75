//! Alert tier classification.
//!
//! Pure functions over a timer's remaining time and the tier it last emitted.
//! The evaluator owns all side effects.

use chrono::{DateTime, Duration, Utc};
use playtime_daemon_protocol::{AlertTier, ServerMessage, TimerStatus};

use crate::config::ExtensionTierPolicy;
use crate::timer::{remaining_minutes_ceil, Timer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertEvent {
    pub timer_id: String,
    pub child_name: String,
    pub tier: AlertTier,
    pub remaining_minutes: i64,
    pub emitted_at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::TimerAlert {
            timer_id: self.timer_id.clone(),
            tier: self.tier,
            remaining_minutes: self.remaining_minutes,
            child_name: self.child_name.clone(),
        }
    }
}

/// The tier window `remaining` falls into, most severe first.
///
/// Checking the smallest threshold first means a timer observed late (already
/// under five minutes) lands on `Five` instead of passing through `Fifteen`.
pub fn tier_for_remaining(remaining: Duration) -> Option<AlertTier> {
    if remaining <= Duration::zero() {
        return None;
    }
    AlertTier::ALL
        .iter()
        .rev()
        .copied()
        .find(|tier| remaining <= Duration::seconds(tier.threshold_secs()))
}

/// Tier to emit for `timer` at `now`, if it is strictly more severe than the
/// one already emitted.
pub fn classify(timer: &Timer, now: DateTime<Utc>) -> Option<AlertTier> {
    if !timer.is_evaluable() {
        return None;
    }
    tier_for_remaining(timer.remaining(now))
        .filter(|tier| tier.is_more_severe_than(timer.last_alert_tier))
}

/// Status after observing `remaining`. Never moves backwards.
pub fn next_status(current: TimerStatus, remaining: Duration, tier: Option<AlertTier>) -> TimerStatus {
    let observed = if remaining <= Duration::zero() {
        TimerStatus::Expired
    } else if tier.is_some() || tier_for_remaining(remaining).is_some() {
        TimerStatus::Alert
    } else {
        TimerStatus::Active
    };
    current.max(observed)
}

pub fn build_event(timer: &Timer, tier: AlertTier, now: DateTime<Utc>) -> AlertEvent {
    AlertEvent {
        timer_id: timer.id.clone(),
        child_name: timer.child_name.clone(),
        tier,
        remaining_minutes: remaining_minutes_ceil(timer.remaining(now)),
        emitted_at: now,
    }
}

/// `last_alert_tier` to keep after an extension leaves `remaining` on the clock.
pub fn tier_after_extension(
    last: Option<AlertTier>,
    remaining: Duration,
    policy: ExtensionTierPolicy,
) -> Option<AlertTier> {
    match policy {
        ExtensionTierPolicy::Keep => last,
        ExtensionTierPolicy::Reset => match (last, tier_for_remaining(remaining)) {
            (Some(last), Some(window)) => Some(last.min(window)),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::parse_rfc3339;

    fn now() -> DateTime<Utc> {
        parse_rfc3339("2026-03-01T10:00:00Z").expect("timestamp")
    }

    fn timer_with(remaining: Duration, last: Option<AlertTier>, status: TimerStatus) -> Timer {
        let now = now();
        Timer {
            id: "tmr-1".to_string(),
            child_name: "Mia".to_string(),
            child_age: None,
            start_at: now - Duration::minutes(30),
            end_at: now + remaining,
            extended_minutes: 0,
            status,
            last_alert_tier: last,
            updated_at: now,
        }
    }

    #[test]
    fn windows_by_threshold() {
        assert_eq!(tier_for_remaining(Duration::minutes(16)), None);
        assert_eq!(tier_for_remaining(Duration::minutes(15)), Some(AlertTier::Fifteen));
        assert_eq!(tier_for_remaining(Duration::seconds(870)), Some(AlertTier::Fifteen));
        assert_eq!(tier_for_remaining(Duration::seconds(585)), Some(AlertTier::Ten));
        assert_eq!(tier_for_remaining(Duration::minutes(5)), Some(AlertTier::Five));
        assert_eq!(tier_for_remaining(Duration::seconds(1)), Some(AlertTier::Five));
        assert_eq!(tier_for_remaining(Duration::zero()), None);
    }

    #[test]
    fn sub_second_remainder_is_not_expired() {
        let half_second = Duration::milliseconds(500);
        assert_eq!(tier_for_remaining(half_second), Some(AlertTier::Five));
        assert_eq!(
            next_status(TimerStatus::Alert, half_second, Some(AlertTier::Five)),
            TimerStatus::Alert
        );
        assert_eq!(
            tier_for_remaining(Duration::minutes(15) + half_second),
            None
        );
    }

    #[test]
    fn late_observation_skips_to_most_severe() {
        let timer = timer_with(Duration::minutes(4), None, TimerStatus::Active);
        assert_eq!(classify(&timer, now()), Some(AlertTier::Five));
    }

    #[test]
    fn equal_or_weaker_tier_is_not_reemitted() {
        let timer = timer_with(Duration::minutes(14), Some(AlertTier::Fifteen), TimerStatus::Alert);
        assert_eq!(classify(&timer, now()), None);

        let timer = timer_with(Duration::minutes(14), Some(AlertTier::Five), TimerStatus::Alert);
        assert_eq!(classify(&timer, now()), None);
    }

    #[test]
    fn classify_is_idempotent_once_recorded() {
        let mut timer = timer_with(Duration::seconds(585), Some(AlertTier::Fifteen), TimerStatus::Alert);
        let first = classify(&timer, now());
        assert_eq!(first, Some(AlertTier::Ten));
        timer.last_alert_tier = first;
        assert_eq!(classify(&timer, now()), None);
        assert_eq!(classify(&timer, now()), None);
    }

    #[test]
    fn tiers_only_advance_through_a_countdown() {
        let mut timer = timer_with(Duration::minutes(20), None, TimerStatus::Active);
        let start = now();
        let mut emitted = Vec::new();
        for step in 0..=(20 * 60 / 5) {
            let at = start + Duration::seconds(step * 5);
            if let Some(tier) = classify(&timer, at) {
                assert!(tier.is_more_severe_than(timer.last_alert_tier));
                emitted.push(tier);
                timer.last_alert_tier = Some(tier);
            }
            timer.status = next_status(timer.status, timer.remaining(at), timer.last_alert_tier);
        }
        assert_eq!(emitted, vec![AlertTier::Fifteen, AlertTier::Ten, AlertTier::Five]);
        assert_eq!(timer.status, TimerStatus::Expired);
    }

    #[test]
    fn expired_timers_never_classify() {
        let timer = timer_with(Duration::minutes(3), None, TimerStatus::Expired);
        assert_eq!(classify(&timer, now()), None);
    }

    #[test]
    fn status_never_regresses() {
        assert_eq!(
            next_status(TimerStatus::Alert, Duration::minutes(40), Some(AlertTier::Ten)),
            TimerStatus::Alert
        );
        assert_eq!(
            next_status(TimerStatus::Active, Duration::minutes(40), None),
            TimerStatus::Active
        );
        assert_eq!(
            next_status(TimerStatus::Active, Duration::minutes(12), None),
            TimerStatus::Alert
        );
        assert_eq!(
            next_status(TimerStatus::Alert, Duration::seconds(-2), Some(AlertTier::Five)),
            TimerStatus::Expired
        );
    }

    #[test]
    fn event_reports_rounded_minutes() {
        let timer = timer_with(Duration::seconds(870), None, TimerStatus::Active);
        let event = build_event(&timer, AlertTier::Fifteen, now());
        assert_eq!(event.remaining_minutes, 15);
        assert_eq!(event.emitted_at, now());
        match event.to_message() {
            ServerMessage::TimerAlert { tier, child_name, .. } => {
                assert_eq!(tier, AlertTier::Fifteen);
                assert_eq!(child_name, "Mia");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn keep_policy_leaves_tier() {
        let tier = tier_after_extension(
            Some(AlertTier::Five),
            Duration::minutes(25),
            ExtensionTierPolicy::Keep,
        );
        assert_eq!(tier, Some(AlertTier::Five));
    }

    #[test]
    fn reset_policy_rewinds_to_current_window() {
        assert_eq!(
            tier_after_extension(Some(AlertTier::Five), Duration::minutes(25), ExtensionTierPolicy::Reset),
            None
        );
        assert_eq!(
            tier_after_extension(Some(AlertTier::Five), Duration::minutes(12), ExtensionTierPolicy::Reset),
            Some(AlertTier::Fifteen)
        );
        // An extension never marks a tier as emitted that was not.
        assert_eq!(
            tier_after_extension(None, Duration::minutes(12), ExtensionTierPolicy::Reset),
            None
        );
        assert_eq!(
            tier_after_extension(Some(AlertTier::Fifteen), Duration::minutes(7), ExtensionTierPolicy::Reset),
            Some(AlertTier::Fifteen)
        );
    }
}

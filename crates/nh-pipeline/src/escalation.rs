//! Escalation Engine
//!
//! Decides whether an unresolved notification moves to the next escalation
//! level (broadening the recipient audience) or has exhausted its levels.
//! "Unresolved" means the notification row is still non-terminal when the
//! sweep fires; the delay and level cap are explicit policy inputs.

use std::time::Duration;

use nh_common::Notification;

/// Escalation policy. The per-level recipient lists broaden the audience:
/// index 0 is added at level 1, index 1 at level 2, and so on.
#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    pub enabled: bool,
    pub delay: Duration,
    pub max_levels: u32,
    pub level_recipients: Vec<Vec<String>>,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_secs(300),
            max_levels: 3,
            level_recipients: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationDecision {
    /// Move to `next_level`, adding `recipients` to the audience, and check
    /// again after `delay`.
    Escalate {
        next_level: u32,
        recipients: Vec<String>,
        delay: Duration,
    },
    /// All levels used up; the notification is abandoned as failed.
    Exhausted,
    /// Escalation is switched off.
    Disabled,
}

pub struct EscalationEngine {
    policy: EscalationPolicy,
}

impl EscalationEngine {
    pub fn new(policy: EscalationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    pub fn evaluate(&self, notification: &Notification) -> EscalationDecision {
        if !self.policy.enabled {
            return EscalationDecision::Disabled;
        }

        let current_level = notification.escalation_level;
        if current_level >= self.policy.max_levels {
            return EscalationDecision::Exhausted;
        }

        let next_level = current_level + 1;
        let recipients = self
            .policy
            .level_recipients
            .get(current_level as usize)
            .cloned()
            .unwrap_or_default();

        EscalationDecision::Escalate {
            next_level,
            recipients,
            delay: self.policy.delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nh_common::{ChannelKind, NotificationPriority, NotificationStatus};
    use std::collections::HashMap;

    fn notification_at_level(level: u32) -> Notification {
        Notification {
            id: "n-1".to_string(),
            external_id: None,
            notification_type: "alert".to_string(),
            priority: NotificationPriority::Critical,
            title: "t".to_string(),
            message: "m".to_string(),
            html_message: None,
            template_name: None,
            variables: HashMap::new(),
            recipients: vec!["ops@example.com".to_string()],
            channels: vec![ChannelKind::Email],
            created_at: Utc::now(),
            scheduled_at: None,
            expires_at: None,
            max_retries: 3,
            source_service: None,
            source_tool: None,
            user_id: None,
            created_by: None,
            status: NotificationStatus::Processing,
            escalation_level: level,
            escalated_at: None,
            next_escalation_at: None,
        }
    }

    fn engine() -> EscalationEngine {
        EscalationEngine::new(EscalationPolicy {
            enabled: true,
            delay: Duration::from_secs(300),
            max_levels: 3,
            level_recipients: vec![
                vec!["oncall@example.com".to_string()],
                vec!["lead@example.com".to_string()],
            ],
        })
    }

    #[test]
    fn test_levels_advance_until_cap() {
        let engine = engine();

        match engine.evaluate(&notification_at_level(0)) {
            EscalationDecision::Escalate {
                next_level,
                recipients,
                delay,
            } => {
                assert_eq!(next_level, 1);
                assert_eq!(recipients, vec!["oncall@example.com".to_string()]);
                assert_eq!(delay, Duration::from_secs(300));
            }
            other => panic!("unexpected decision: {other:?}"),
        }

        // Level 2 has no configured recipients: escalates with an empty add
        match engine.evaluate(&notification_at_level(2)) {
            EscalationDecision::Escalate {
                next_level,
                recipients,
                ..
            } => {
                assert_eq!(next_level, 3);
                assert!(recipients.is_empty());
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_exhausted_at_max_level() {
        let engine = engine();
        assert_eq!(
            engine.evaluate(&notification_at_level(3)),
            EscalationDecision::Exhausted
        );
        assert_eq!(
            engine.evaluate(&notification_at_level(7)),
            EscalationDecision::Exhausted
        );
    }

    #[test]
    fn test_disabled_policy() {
        let engine = EscalationEngine::new(EscalationPolicy {
            enabled: false,
            ..Default::default()
        });
        assert_eq!(
            engine.evaluate(&notification_at_level(0)),
            EscalationDecision::Disabled
        );
    }
}

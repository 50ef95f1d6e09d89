//! The rule engine (`Watcher` in the Python original): periodically
//! evaluates every configured rule against the half-open window
//! `(last_check, now]`, groups matching rows by `(computer, event_id)`,
//! and dispatches actions for any group crossing its threshold.

use crate::credentials::CredentialProvider;
use crate::model::{Action, Level, Rule, TriggeredGroup};
use crate::notify::{Notifier, Remediator};
use crate::store::Store;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Runs one rule against the store's `(since, until]` window and returns
/// the `(computer, event_id)` groups whose count met the threshold.
pub fn evaluate_rule(store: &Store, rule: &Rule, since: DateTime<Utc>, until: DateTime<Utc>) -> crate::error::Result<Vec<TriggeredGroup>> {
    let rows = store.rows_since(since, until)?;

    let mut counts: HashMap<(String, u32), i64> = HashMap::new();
    for row in &rows {
        if !rule.event_ids.is_empty() && !rule.event_ids.contains(&row.entry.event_id) {
            continue;
        }
        if let Some(severity) = rule.severity {
            if row.entry.level != severity {
                continue;
            }
        }
        *counts.entry((row.entry.computer.clone(), row.entry.event_id)).or_insert(0) += 1;
    }

    let mut groups: Vec<TriggeredGroup> = counts
        .into_iter()
        .filter(|(_, count)| *count >= rule.threshold as i64)
        .map(|((computer, event_id), count)| TriggeredGroup {
            computer,
            event_id,
            count,
        })
        .collect();

    groups.sort_by(|a, b| a.computer.cmp(&b.computer).then(a.event_id.cmp(&b.event_id)));
    Ok(groups)
}

/// Formats the alert body exactly as the Python original's
/// `Watcher._trigger_alert` does: `"**Alert: <name>**\n\nTriggered
/// conditions:\n- <host>: Event <id> (<n> times)\n..."`.
pub fn format_alert(rule_name: &str, groups: &[TriggeredGroup]) -> String {
    let mut body = format!("**Alert: {rule_name}**\n\nTriggered conditions:\n");
    for g in groups {
        body.push_str(&format!("- {}: Event {} ({} times)\n", g.computer, g.event_id, g.count));
    }
    body
}

/// Dispatches every action attached to `rule` for the groups that fired.
/// One action's failure is logged and does not stop the remaining actions
/// (spec §4.6 "Independence").
pub async fn dispatch_actions(
    rule: &Rule,
    groups: &[TriggeredGroup],
    notifier: &dyn Notifier,
    remediator: &Remediator,
    credentials: &dyn CredentialProvider,
) {
    let alert_text = format_alert(&rule.name, groups);

    for action in &rule.actions {
        match action {
            Action::Webhook { url, flavor } => {
                if let Err(e) = notifier.send(url, &alert_text, flavor).await {
                    warn!(rule = %rule.name, url, error = %e, "webhook notification failed");
                }
            }
            Action::Email { to } => {
                info!(rule = %rule.name, to = ?to, "email action dispatched (stub notifier)");
                if let Err(e) = notifier.send_email(to.as_deref(), &alert_text).await {
                    warn!(rule = %rule.name, error = %e, "email notification failed");
                }
            }
            Action::Remediation { script } => {
                for group in groups {
                    let creds = match credentials.resolve(&group.computer) {
                        Ok(c) => c,
                        Err(e) => {
                            warn!(rule = %rule.name, host = %group.computer, error = %e, "no credentials, skipping remediation");
                            continue;
                        }
                    };
                    if let Err(e) = remediator.run(&group.computer, script, &creds).await {
                        warn!(rule = %rule.name, host = %group.computer, error = %e, "remediation failed");
                    }
                }
            }
        }
    }
}

/// One tick's worth of wall-clock bookkeeping for the watcher loop.
pub struct Watcher {
    store: Arc<Store>,
    rules: Vec<Rule>,
    notifier: Arc<dyn Notifier>,
    remediator: Arc<Remediator>,
    credentials: Arc<dyn CredentialProvider>,
    last_check: DateTime<Utc>,
}

impl Watcher {
    /// `last_check` starts at `now - 1h` so the first tick has a sensible
    /// window (spec §4.6).
    pub fn new(
        store: Arc<Store>,
        rules: Vec<Rule>,
        notifier: Arc<dyn Notifier>,
        remediator: Arc<Remediator>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            store,
            rules,
            notifier,
            remediator,
            credentials,
            last_check: Utc::now() - ChronoDuration::hours(1),
        }
    }

    #[cfg(test)]
    pub fn with_last_check(
        store: Arc<Store>,
        rules: Vec<Rule>,
        notifier: Arc<dyn Notifier>,
        remediator: Arc<Remediator>,
        credentials: Arc<dyn CredentialProvider>,
        last_check: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            rules,
            notifier,
            remediator,
            credentials,
            last_check,
        }
    }

    /// Evaluates every rule against `(last_check, now]`, dispatches actions
    /// for whichever rules fired, then advances `last_check` to `now`.
    /// `last_check` always advances, even if a rule's evaluation fails —
    /// per spec §4.6, out-of-order events are a known, accepted limitation.
    pub async fn tick(&mut self) {
        let now = Utc::now();

        for rule in &self.rules {
            match evaluate_rule(&self.store, rule, self.last_check, now) {
                Ok(groups) if !groups.is_empty() => {
                    info!(rule = %rule.name, fired_groups = groups.len(), "rule fired");
                    dispatch_actions(rule, &groups, self.notifier.as_ref(), &self.remediator, self.credentials.as_ref()).await;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(rule = %rule.name, error = %e, "rule evaluation failed, skipping this tick");
                }
            }
        }

        self.last_check = now;
    }

    pub fn last_check(&self) -> DateTime<Utc> {
        self.last_check
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialProvider;
    use crate::model::LogEntry;
    use crate::notify::MockNotifier;
    use crate::transport::Credentials;
    use chrono::TimeZone;

    fn entry(computer: &str, event_id: u32, level: Level, ts: DateTime<Utc>) -> LogEntry {
        LogEntry {
            timestamp: ts,
            event_id,
            level,
            source: "src".to_string(),
            message: "msg".to_string(),
            computer: computer.to_string(),
            log_name: "Security".to_string(),
            user: None,
            raw_xml: None,
        }
    }

    #[test]
    fn s3_threshold_met_fires_with_correct_count() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let rows: Vec<LogEntry> = (0..5)
            .map(|i| entry("10.0.0.1", 4625, Level::Error, t0 + ChronoDuration::minutes(i)))
            .collect();
        store.insert_batch(&rows).unwrap();

        let rule = Rule {
            name: "Failed Login Attempts".to_string(),
            event_ids: vec![4625],
            severity: None,
            threshold: 5,
            actions: vec![],
        };

        let groups = evaluate_rule(&store, &rule, t0 - ChronoDuration::seconds(1), t1).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].computer, "10.0.0.1");
        assert_eq!(groups[0].count, 5);

        let alert = format_alert(&rule.name, &groups);
        assert!(alert.contains("10.0.0.1"));
        assert!(alert.contains("5 times"));
    }

    #[test]
    fn s4_below_threshold_does_not_fire() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let rows: Vec<LogEntry> = (0..4)
            .map(|i| entry("10.0.0.1", 4625, Level::Error, t0 + ChronoDuration::minutes(i)))
            .collect();
        store.insert_batch(&rows).unwrap();

        let rule = Rule {
            name: "Failed Login Attempts".to_string(),
            event_ids: vec![4625],
            severity: None,
            threshold: 5,
            actions: vec![],
        };

        let groups = evaluate_rule(&store, &rule, t0 - ChronoDuration::seconds(1), t1).unwrap();
        assert!(groups.is_empty());
    }

    #[tokio::test]
    async fn tick_dispatches_webhook_exactly_once_on_fire() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let t0 = Utc::now() - ChronoDuration::minutes(30);
        let rows: Vec<LogEntry> = (0..5).map(|i| entry("10.0.0.1", 4625, Level::Error, t0 + ChronoDuration::seconds(i))).collect();
        store.insert_batch(&rows).unwrap();

        let rule = Rule {
            name: "Failed Login Attempts".to_string(),
            event_ids: vec![4625],
            severity: None,
            threshold: 5,
            actions: vec![Action::Webhook {
                url: "https://example.invalid/hook".to_string(),
                flavor: "slack".to_string(),
            }],
        };

        let notifier = Arc::new(MockNotifier::new());
        let remediator = Arc::new(Remediator::new(Arc::new(crate::transport::MockExecutor::new())));
        let credentials = Arc::new(StaticCredentialProvider::new(Credentials {
            username: "u".into(),
            password: "p".into(),
        }));

        let mut watcher = Watcher::with_last_check(
            Arc::clone(&store),
            vec![rule],
            notifier.clone(),
            remediator,
            credentials,
            Utc::now() - ChronoDuration::hours(1),
        );

        watcher.tick().await;

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("5 times"));
    }

    #[tokio::test]
    async fn one_rule_failure_does_not_block_another_rule() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let t0 = Utc::now() - ChronoDuration::minutes(30);
        store
            .insert_batch(&[entry("10.0.0.1", 4624, Level::Information, t0)])
            .unwrap();

        let broken_rule = Rule {
            name: "broken".to_string(),
            event_ids: vec![],
            severity: None,
            threshold: 1,
            actions: vec![Action::Webhook {
                url: "https://example.invalid/broken".to_string(),
                flavor: "slack".to_string(),
            }],
        };
        let working_rule = Rule {
            name: "working".to_string(),
            event_ids: vec![4624],
            severity: None,
            threshold: 1,
            actions: vec![Action::Webhook {
                url: "https://example.invalid/working".to_string(),
                flavor: "slack".to_string(),
            }],
        };

        let notifier = Arc::new(MockNotifier::new());
        let remediator = Arc::new(Remediator::new(Arc::new(crate::transport::MockExecutor::new())));
        let credentials = Arc::new(StaticCredentialProvider::new(Credentials {
            username: "u".into(),
            password: "p".into(),
        }));

        let mut watcher = Watcher::with_last_check(
            store,
            vec![broken_rule, working_rule],
            notifier.clone(),
            remediator,
            credentials,
            Utc::now() - ChronoDuration::hours(1),
        );

        watcher.tick().await;
        assert_eq!(notifier.sent().len(), 2);
    }
}

//! Per-host collection: builds the `Get-WinEvent` snippet for each
//! configured channel, invokes the remote executor, and feeds stdout to the
//! parser. Modeled on the Python original's `LogCollector`/`RemoteHost`
//! pair, but split so the executor is swappable (real WinRM vs. a scripted
//! mock in tests).

use crate::model::{HostTarget, LogEntry};
use crate::parser::{parse_events, EVENT_SEPARATOR};
use crate::transport::{Credentials, RemoteExecutor};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, warn};

/// Outcome of pulling one channel from one host.
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    pub log_name: String,
    pub ok: bool,
    pub error: Option<String>,
    pub entry_count: usize,
}

/// Everything produced by collecting one host in one cycle.
#[derive(Debug, Clone, Default)]
pub struct HostBatch {
    pub entries: Vec<LogEntry>,
    pub channel_statuses: Vec<ChannelStatus>,
}

impl HostBatch {
    pub fn any_channel_succeeded(&self) -> bool {
        self.channel_statuses.iter().any(|s| s.ok)
    }
}

/// Builds the PowerShell snippet for one channel: pulls events newer than
/// `start`, capped at `max_events`, emitting each event's XML followed by
/// the sentinel separator (spec §4.3).
pub fn build_query(log_name: &str, start: DateTime<Utc>, max_events: u32) -> String {
    let start_iso = start.to_rfc3339();
    format!(
        "$ErrorActionPreference = 'Stop'; \
         $events = Get-WinEvent -FilterHashtable @{{LogName='{log_name}'; StartTime='{start_iso}'}} -MaxEvents {max_events} -ErrorAction SilentlyContinue; \
         foreach ($e in $events) {{ Write-Output $e.ToXml(); Write-Output '{EVENT_SEPARATOR}' }}"
    )
}

/// Collects every configured channel from one host, returning the
/// aggregated batch and a per-channel status vector. A channel's failure
/// never discards another channel's results (spec §4.3).
pub fn collect_host(
    executor: &dyn RemoteExecutor,
    target: &HostTarget,
    credentials: &Credentials,
    log_types: &[String],
    hours_back: i64,
    max_events: u32,
) -> HostBatch {
    let start = Utc::now() - ChronoDuration::hours(hours_back);
    let mut batch = HostBatch::default();

    for log_name in log_types {
        let script = build_query(log_name, start, max_events);

        match executor.execute(target, credentials, &script) {
            Ok(output) => {
                let entries = parse_events(&output.stdout, &target.ip, log_name);
                debug!(host = %target.ip, log_name, count = entries.len(), "collected channel");
                batch.channel_statuses.push(ChannelStatus {
                    log_name: log_name.clone(),
                    ok: true,
                    error: None,
                    entry_count: entries.len(),
                });
                batch.entries.extend(entries);
            }
            Err(e) => {
                warn!(host = %target.ip, log_name, error = %e, "channel collection failed");
                batch.channel_statuses.push(ChannelStatus {
                    log_name: log_name.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                    entry_count: 0,
                });
            }
        }
    }

    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockExecutor, ScriptedResponse};
    use crate::transport::ExecutionOutput;

    fn target(ip: &str) -> HostTarget {
        HostTarget {
            ip: ip.to_string(),
            port: 5985,
            transport: Default::default(),
            timeout: 120,
            credentials: None,
        }
    }

    const SAMPLE_EVENT: &str = r#"<Event xmlns="http://schemas.microsoft.com/win/2004/08/events/event">
  <System>
    <Provider Name="Microsoft-Windows-Security-Auditing" />
    <EventID>4625</EventID>
    <Level>2</Level>
    <TimeCreated SystemTime="2024-01-15T10:30:00.000Z" />
    <Computer>HOST01</Computer>
  </System>
  <EventData>
    <Data Name="TargetUserName">DOMAIN\alice</Data>
  </EventData>
</Event>"#;

    #[test]
    fn collects_all_channels_and_tags_entries() {
        let exec = MockExecutor::new();
        let stdout = format!("{SAMPLE_EVENT}{EVENT_SEPARATOR}");
        exec.push_stdout("10.0.0.1", stdout.clone().into_bytes());
        exec.push_stdout("10.0.0.1", stdout.into_bytes());

        let creds = Credentials {
            username: "u".into(),
            password: "p".into(),
        };
        let log_types = vec!["Security".to_string(), "System".to_string()];
        let batch = collect_host(&exec, &target("10.0.0.1"), &creds, &log_types, 1, 10_000);

        assert_eq!(batch.entries.len(), 2);
        assert_eq!(batch.channel_statuses.len(), 2);
        assert!(batch.any_channel_succeeded());
        assert_eq!(batch.entries[0].computer, "10.0.0.1");
        assert_eq!(batch.entries[0].log_name, "Security");
        assert_eq!(batch.entries[1].log_name, "System");
    }

    #[test]
    fn one_failed_channel_does_not_discard_the_other() {
        let exec = MockExecutor::new();
        let stdout = format!("{SAMPLE_EVENT}{EVENT_SEPARATOR}");
        exec.push(
            "10.0.0.1",
            ScriptedResponse::TransportError("boom".to_string()),
        );
        exec.push(
            "10.0.0.1",
            ScriptedResponse::Output(ExecutionOutput {
                stdout: stdout.into_bytes(),
                stderr: Vec::new(),
                status: 0,
            }),
        );

        let creds = Credentials {
            username: "u".into(),
            password: "p".into(),
        };
        let log_types = vec!["Security".to_string(), "System".to_string()];
        let batch = collect_host(&exec, &target("10.0.0.1"), &creds, &log_types, 1, 10_000);

        assert_eq!(batch.entries.len(), 1);
        assert!(batch.any_channel_succeeded());
        assert_eq!(batch.channel_statuses.iter().filter(|s| !s.ok).count(), 1);
    }

    #[test]
    fn query_embeds_log_name_start_and_cap() {
        let start = DateTime::parse_from_rfc3339("2024-01-15T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let q = build_query("Security", start, 10_000);
        assert!(q.contains("LogName='Security'"));
        assert!(q.contains("-MaxEvents 10000"));
        assert!(q.contains(EVENT_SEPARATOR));
    }
}

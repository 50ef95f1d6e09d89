use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a Windows event, mapped from the numeric `Level` field in the
/// event's `<System>` block. Unrecognized numeric values map to `Unknown`
/// rather than being dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    Critical,
    Error,
    Warning,
    Information,
    Verbose,
    Unknown,
}

impl Level {
    /// Maps the numeric `Level` element text per the Windows Event Schema:
    /// 1=Critical, 2=Error, 3=Warning, 4=Information, 5=Verbose.
    pub fn from_numeric(n: u32) -> Self {
        match n {
            1 => Level::Critical,
            2 => Level::Error,
            3 => Level::Warning,
            4 => Level::Information,
            5 => Level::Verbose,
            _ => Level::Unknown,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Level::Critical => "Critical",
            Level::Error => "Error",
            Level::Warning => "Warning",
            Level::Information => "Information",
            Level::Verbose => "Verbose",
            Level::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Level {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Critical" => Level::Critical,
            "Error" => Level::Error,
            "Warning" => Level::Warning,
            "Information" => Level::Information,
            "Verbose" => Level::Verbose,
            _ => Level::Unknown,
        })
    }
}

/// The canonical normalized event, produced by the parser and consumed by
/// the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub event_id: u32,
    pub level: Level,
    pub source: String,
    pub message: String,
    pub computer: String,
    pub log_name: String,
    pub user: Option<String>,
    pub raw_xml: Option<String>,
}

pub const MESSAGE_MAX_CHARS: usize = 1_000;
pub const RAW_XML_MAX_BYTES: usize = 5_000;

/// Truncates `s` to at most `max_chars` Unicode scalar values.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Truncates `s` to at most `max_bytes` bytes without splitting a
/// multi-byte UTF-8 sequence.
pub fn truncate_bytes(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// A store row: a `LogEntry` plus the identifiers assigned at insert time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredLogEntry {
    pub id: i64,
    pub entry: LogEntry,
    pub created_at: DateTime<Utc>,
}

/// Supported WinRM authentication transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Ntlm,
    Kerberos,
    Basic,
    Credssp,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Ntlm
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Transport::Ntlm => "ntlm",
            Transport::Kerberos => "kerberos",
            Transport::Basic => "basic",
            Transport::Credssp => "credssp",
        };
        f.write_str(s)
    }
}

fn default_port() -> u16 {
    5985
}

fn default_timeout() -> u64 {
    120
}

/// Configuration-side entity for one remote Windows host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostTarget {
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Credentials embedded directly in config. Discouraged; only consulted
    /// as the third step of the credential fallback chain.
    #[serde(default)]
    pub credentials: Option<InlineCredentials>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineCredentials {
    pub username: String,
    pub password: String,
}

/// An action dispatched when a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
    Webhook {
        url: String,
        #[serde(default = "default_flavor")]
        flavor: String,
    },
    Email {
        #[serde(default)]
        to: Option<String>,
    },
    Remediation {
        script: String,
    },
}

fn default_flavor() -> String {
    "slack".to_string()
}

fn default_threshold() -> u32 {
    1
}

/// A user-defined alerting rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub event_ids: Vec<u32>,
    #[serde(default)]
    pub severity: Option<Level>,
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// One grouped `(computer, event_id)` count that crossed a rule's threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggeredGroup {
    pub computer: String,
    pub event_id: u32,
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_from_numeric_maps_known_values() {
        assert_eq!(Level::from_numeric(1), Level::Critical);
        assert_eq!(Level::from_numeric(2), Level::Error);
        assert_eq!(Level::from_numeric(3), Level::Warning);
        assert_eq!(Level::from_numeric(4), Level::Information);
        assert_eq!(Level::from_numeric(5), Level::Verbose);
    }

    #[test]
    fn level_from_numeric_unknown_is_not_dropped() {
        assert_eq!(Level::from_numeric(99), Level::Unknown);
        assert_eq!(Level::from_numeric(0), Level::Unknown);
    }

    #[test]
    fn truncate_chars_respects_scalar_boundaries() {
        let s = "héllo wörld";
        let truncated = truncate_chars(s, 5);
        assert_eq!(truncated.chars().count(), 5);
    }

    #[test]
    fn truncate_bytes_never_splits_utf8() {
        let s = "a".repeat(10) + "€€€€€";
        let truncated = truncate_bytes(&s, 12);
        assert!(truncated.len() <= 12);
        assert!(String::from_utf8(truncated.into_bytes()).is_ok());
    }
}

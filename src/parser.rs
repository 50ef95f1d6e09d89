//! Decodes Windows Event XML envelopes into normalized [`LogEntry`] values.
//!
//! Input is a byte string containing zero or more `<Event>` documents,
//! separated by the literal sentinel `---EVENT_SEPARATOR---` that the
//! PowerShell snippet built in [`crate::collector`] writes after each
//! event. Per-fragment failures are counted and skipped; the batch itself
//! never fails.

use crate::model::{truncate_bytes, truncate_chars, Level, LogEntry, MESSAGE_MAX_CHARS, RAW_XML_MAX_BYTES};
use chrono::{DateTime, Utc};
use tracing::debug;

pub const EVENT_SEPARATOR: &str = "---EVENT_SEPARATOR---";
const MIN_FRAGMENT_LEN: usize = 50;
const EVENT_NS: &str = "http://schemas.microsoft.com/win/2004/08/events/event";

/// Strips control characters outside the XML 1.0 legal character range.
///
/// Removes U+0000-U+0008, U+000B, U+000C, U+000E-U+001F, U+007F-U+009F,
/// then drops any remaining code point outside XML 1.0's legal set
/// (`#x9 | #xA | #xD | [#x20-#xD7FF] | [#xE000-#xFFFD] | [#x10000-#x10FFFF]`).
pub fn sanitize_xml(input: &str) -> String {
    input
        .chars()
        .filter(|&c| {
            let cp = c as u32;
            let is_disallowed_control = matches!(cp, 0x00..=0x08 | 0x0B | 0x0C | 0x0E..=0x1F | 0x7F..=0x9F);
            if is_disallowed_control {
                return false;
            }
            matches!(cp,
                0x09 | 0x0A | 0x0D
                | 0x20..=0xD7FF
                | 0xE000..=0xFFFD
                | 0x10000..=0x10FFFF
            )
        })
        .collect()
}

/// Parses a raw collector payload (one or more sentinel-separated event XML
/// fragments) into an ordered sequence of [`LogEntry`]. Never panics and
/// never fails the whole batch: malformed fragments are skipped and logged.
pub fn parse_events(payload: &[u8], computer: &str, log_name: &str) -> Vec<LogEntry> {
    let text = String::from_utf8_lossy(payload);
    let mut entries = Vec::new();

    for fragment in text.split(EVENT_SEPARATOR) {
        let sanitized = sanitize_xml(fragment.trim());
        if sanitized.len() < MIN_FRAGMENT_LEN {
            continue;
        }

        match parse_fragment(&sanitized, computer, log_name) {
            Ok(entry) => entries.push(entry),
            Err(reason) => debug!(%reason, "skipping unparseable event fragment"),
        }
    }

    entries
}

fn parse_fragment(xml: &str, computer: &str, log_name: &str) -> Result<LogEntry, String> {
    let doc = roxmltree::Document::parse(xml).map_err(|e| e.to_string())?;
    let root = doc.root_element();

    let system = find_child(&root, "System").ok_or("missing <System> element")?;

    let event_id_text = find_child(&system, "EventID")
        .and_then(|n| n.text())
        .ok_or("missing <EventID>")?;
    let event_id: u32 = event_id_text.trim().parse().map_err(|_| "unparseable EventID")?;

    let level_text = find_child(&system, "Level").and_then(|n| n.text());
    let level = match level_text {
        Some(t) => Level::from_numeric(t.trim().parse().unwrap_or(u32::MAX)),
        None => return Err("missing <Level>".to_string()),
    };

    let system_time = find_child(&system, "TimeCreated")
        .and_then(|n| n.attribute("SystemTime"))
        .ok_or("missing TimeCreated/@SystemTime")?;
    let timestamp = parse_system_time(system_time).ok_or("unparseable SystemTime")?;

    let source = find_child(&system, "Provider")
        .and_then(|n| n.attribute("Name"))
        .unwrap_or("Unknown")
        .to_string();

    let message = build_message(&root);
    let message = truncate_chars(&message, MESSAGE_MAX_CHARS);

    let raw_xml = truncate_bytes(xml, RAW_XML_MAX_BYTES);

    Ok(LogEntry {
        timestamp,
        event_id,
        level,
        source,
        message,
        computer: computer.to_string(),
        log_name: log_name.to_string(),
        user: None,
        raw_xml: Some(raw_xml),
    })
}

/// Joins the text of every `EventData/Data` child with ` | `; `"No message"`
/// if there are none.
fn build_message(root: &roxmltree::Node) -> String {
    let event_data = match find_child(root, "EventData") {
        Some(n) => n,
        None => return "No message".to_string(),
    };

    let parts: Vec<&str> = event_data
        .children()
        .filter(|n| n.is_element() && n.tag_name().name() == "Data")
        .filter_map(|n| n.text())
        .collect();

    if parts.is_empty() {
        "No message".to_string()
    } else {
        parts.join(" | ")
    }
}

/// Finds a direct child element by local name, ignoring the event namespace.
fn find_child<'a>(parent: &'a roxmltree::Node<'a, 'a>, local_name: &str) -> Option<roxmltree::Node<'a, 'a>> {
    parent.children().find(|n| {
        n.is_element()
            && n.tag_name().name() == local_name
            && (n.tag_name().namespace() == Some(EVENT_NS) || n.tag_name().namespace().is_none())
    })
}

/// Parses `TimeCreated/@SystemTime`. A trailing `Z` or explicit offset is
/// required; the result is always converted to UTC. Windows frequently
/// emits 7-digit fractional seconds, which RFC3339 does not accept, so we
/// fall back to a truncated-precision retry.
fn parse_system_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    if let (Some(dot), Some(z)) = (s.find('.'), s.find('Z')) {
        if dot < z {
            let frac = &s[dot + 1..z];
            if frac.len() > 6 {
                let truncated = format!("{}.{}Z", &s[..dot], &frac[..6]);
                if let Ok(dt) = DateTime::parse_from_rfc3339(&truncated) {
                    return Some(dt.with_timezone(&Utc));
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const S1_XML: &str = r#"<Event xmlns="http://schemas.microsoft.com/win/2004/08/events/event">
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
    fn s1_parses_minimal_security_4625() {
        let payload = format!("{S1_XML}{EVENT_SEPARATOR}");
        let entries = parse_events(payload.as_bytes(), "10.0.0.1", "Security");
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.event_id, 4625);
        assert_eq!(e.level, Level::Error);
        assert_eq!(e.source, "Microsoft-Windows-Security-Auditing");
        assert_eq!(e.message, "DOMAIN\\alice");
        assert_eq!(
            e.timestamp,
            DateTime::parse_from_rfc3339("2024-01-15T10:30:00Z")
                .unwrap()
                .with_timezone(&Utc)
        );
        assert_eq!(e.computer, "10.0.0.1");
        assert_eq!(e.log_name, "Security");
    }

    #[test]
    fn s2_sanitizer_strips_control_characters() {
        let input = "<E>a\u{0000}b\u{001F}c</E>";
        assert_eq!(sanitize_xml(input), "<E>abc</E>");
    }

    #[test]
    fn fragments_shorter_than_50_bytes_are_skipped() {
        let tiny = format!("<a/>{EVENT_SEPARATOR}");
        let entries = parse_events(tiny.as_bytes(), "h", "System");
        assert!(entries.is_empty());
    }

    #[test]
    fn unknown_level_maps_to_unknown_not_dropped() {
        let xml = S1_XML.replace("<Level>2</Level>", "<Level>42</Level>");
        let entries = parse_events(xml.as_bytes(), "h", "Security");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, Level::Unknown);
    }

    #[test]
    fn missing_required_field_skips_fragment_without_failing_batch() {
        let xml = S1_XML.replace("<EventID>4625</EventID>", "");
        let payload = format!("{xml}{EVENT_SEPARATOR}{S1_XML}");
        let entries = parse_events(payload.as_bytes(), "h", "Security");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn no_event_data_yields_no_message() {
        let xml = S1_XML.replacen(
            "<EventData>\n    <Data Name=\"TargetUserName\">DOMAIN\\alice</Data>\n  </EventData>",
            "",
            1,
        );
        let entries = parse_events(xml.as_bytes(), "h", "Security");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "No message");
    }

    #[test]
    fn seven_digit_fractional_seconds_parse() {
        let xml = S1_XML.replace(
            "SystemTime=\"2024-01-15T10:30:00.000Z\"",
            "SystemTime=\"2024-01-15T10:30:00.1234567Z\"",
        );
        let entries = parse_events(xml.as_bytes(), "h", "Security");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn idempotent_sanitization() {
        let input = "<E>a\x00b\x1Fc\x7Fd</E>";
        let once = sanitize_xml(input);
        let twice = sanitize_xml(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn zero_entries_is_legal_for_empty_payload() {
        let entries = parse_events(b"", "h", "System");
        assert!(entries.is_empty());
    }

    #[test]
    fn message_truncated_to_1000_chars() {
        let long_value = "x".repeat(2000);
        let xml = S1_XML.replace("DOMAIN\\alice", &long_value);
        let entries = parse_events(xml.as_bytes(), "h", "Security");
        assert_eq!(entries[0].message.chars().count(), MESSAGE_MAX_CHARS);
    }
}

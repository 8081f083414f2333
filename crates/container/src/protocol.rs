use regex::Regex;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub enum LineKind {
    Message { role: String, model: Option<String> },
    Result { success: bool, num_turns: u32, cost_usd: f64, result_text: String },
    Other,
}

/// One line of the subprocess's line-delimited JSON stdout protocol. `session_id`/
/// `conversation_id` are orthogonal to `kind`: any line may carry them, fired once by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub kind: LineKind,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLine {
    #[serde(rename = "type")]
    kind: String,
    session_id: Option<String>,
    conversation_id: Option<String>,
    message: Option<RawMessage>,
    is_error: Option<bool>,
    num_turns: Option<u32>,
    cost_usd: Option<f64>,
    total_cost_usd: Option<f64>,
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    model: Option<String>,
}

/// Parses one stdout line. Returns `None` for blank or unparseable lines, matching "unparseable
/// lines are ignored".
pub fn parse_line(line: &str) -> Option<ParsedLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let raw: RawLine = serde_json::from_str(trimmed).ok()?;

    let kind = match raw.kind.as_str() {
        "user" | "assistant" => LineKind::Message { role: raw.kind.clone(), model: raw.message.and_then(|m| m.model) },
        "result" => LineKind::Result {
            success: !raw.is_error.unwrap_or(false),
            num_turns: raw.num_turns.unwrap_or(0),
            cost_usd: raw.total_cost_usd.or(raw.cost_usd).unwrap_or(0.0),
            result_text: raw.result.unwrap_or_default(),
        },
        _ => LineKind::Other,
    };

    Some(ParsedLine { kind, session_id: raw.session_id, conversation_id: raw.conversation_id })
}

/// Extracts the unix-seconds reset timestamp from a `result` text carrying
/// `"usage limit reached|<unix-seconds>"`, per the distinguished `UsageLimit` error.
pub fn usage_limit_reset_at(result_text: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    let re = Regex::new(r"usage limit reached\|(\d+)").ok()?;
    let caps = re.captures(result_text)?;
    let secs: i64 = caps.get(1)?.as_str().parse().ok()?;
    chrono::DateTime::from_timestamp(secs, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_message_and_session_id_together() {
        let line = r#"{"type":"assistant","message":{"model":"claude-sonnet-4"},"session_id":"s1"}"#;
        let parsed = parse_line(line).unwrap();
        assert_eq!(parsed.session_id.as_deref(), Some("s1"));
        assert_eq!(parsed.kind, LineKind::Message { role: "assistant".to_string(), model: Some("claude-sonnet-4".to_string()) });
    }

    #[test]
    fn parses_result_frame() {
        let line = r#"{"type":"result","is_error":false,"num_turns":3,"cost_usd":0.12,"result":"done"}"#;
        let parsed = parse_line(line).unwrap();
        assert_eq!(
            parsed.kind,
            LineKind::Result { success: true, num_turns: 3, cost_usd: 0.12, result_text: "done".to_string() }
        );
    }

    #[test]
    fn ignores_unparseable_line() {
        assert_eq!(parse_line("not json"), None);
    }

    #[test]
    fn ignores_blank_line() {
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn extracts_usage_limit_reset() {
        assert_eq!(usage_limit_reset_at("usage limit reached|1700000000").unwrap().timestamp(), 1700000000);
    }

    #[test]
    fn usage_limit_absent_returns_none() {
        assert_eq!(usage_limit_reset_at("all good"), None);
    }
}

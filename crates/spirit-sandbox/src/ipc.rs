//! Newline-framed JSON IPC between the host and the subordinate process.

use crate::types::{HostMessage, SubordinateMessage};

/// Parses one line of subordinate output. Returns `Ok(None)` for a blank
/// line, `Err` for a line that parses as JSON but carries an unrecognized
/// `type`, or for invalid JSON — callers record only the *first* such error,
/// per spec, and otherwise keep reading.
pub fn parse_line(line: &str) -> Result<Option<SubordinateMessage>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| format!("malformed IPC line: {e}"))?;
    let msg_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| "IPC line missing \"type\"".to_string())?;

    match msg_type {
        "__output__" => {
            let data = value
                .get("data")
                .and_then(|d| d.as_str())
                .ok_or_else(|| "__output__ missing \"data\"".to_string())?
                .to_string();
            Ok(Some(SubordinateMessage::Output { data }))
        }
        "__tool_call__" => {
            let call_id = value
                .get("call_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| "__tool_call__ missing \"call_id\"".to_string())?
                .to_string();
            let name = value
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| "__tool_call__ missing \"name\"".to_string())?
                .to_string();
            let params = value.get("params").cloned().unwrap_or(serde_json::Value::Null);
            Ok(Some(SubordinateMessage::ToolCall {
                call_id,
                name,
                params,
            }))
        }
        "__debug__" => Ok(Some(SubordinateMessage::Debug(value))),
        other => Err(format!("unrecognized IPC message type: {other}")),
    }
}

/// Renders a host-to-subordinate message as a single newline-terminated line.
pub fn encode_line(msg: &HostMessage) -> String {
    let mut line = serde_json::to_string(msg).expect("HostMessage always serializes");
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolResult;

    #[test]
    fn parses_output_message() {
        let msg = parse_line(r#"{"type":"__output__","data":"hi"}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(msg, SubordinateMessage::Output { data } if data == "hi"));
    }

    #[test]
    fn parses_tool_call_message() {
        let msg = parse_line(r#"{"type":"__tool_call__","call_id":"c1","name":"memory_read","params":{"query":"x"}}"#)
            .unwrap()
            .unwrap();
        match msg {
            SubordinateMessage::ToolCall { call_id, name, .. } => {
                assert_eq!(call_id, "c1");
                assert_eq!(name, "memory_read");
            }
            _ => panic!("expected ToolCall"),
        }
    }

    #[test]
    fn blank_line_is_ignored() {
        assert!(parse_line("   ").unwrap().is_none());
    }

    #[test]
    fn malformed_json_is_an_error_not_a_panic() {
        assert!(parse_line("not json").is_err());
    }

    #[test]
    fn unrecognized_type_is_an_error() {
        assert!(parse_line(r#"{"type":"__mystery__"}"#).is_err());
    }

    #[test]
    fn encode_tool_result_round_trips_through_serde() {
        let line = encode_line(&HostMessage::ToolResult {
            call_id: "c1".to_string(),
            result: ToolResult::success("ok"),
        });
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["type"], "__tool_result__");
        assert_eq!(value["call_id"], "c1");
    }

    #[test]
    fn from_dispatch_routes_error_results_to_tool_error() {
        let msg = HostMessage::from_dispatch("c1".to_string(), ToolResult::error("nope"));
        assert!(matches!(msg, HostMessage::ToolError { .. }));
    }
}

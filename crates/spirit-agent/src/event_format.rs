//! Renders an [`ExternalEvent`] into the synthetic user message the agent
//! loop feeds to `process_message`. See spec §6.

use chrono::SecondsFormat;
use spirit_memory::types::ExternalEvent;

pub fn format_event(event: &ExternalEvent) -> String {
    let mut header = vec![format!("[External Event: {}]", event.source)];

    let handle = event.metadata.get("handle").and_then(|v| v.as_str());
    let did = event.metadata.get("did").and_then(|v| v.as_str());
    match (handle, did) {
        (Some(handle), Some(did)) => header.push(format!("From: @{handle} ({did})")),
        (Some(handle), None) => header.push(format!("From: @{handle}")),
        (None, Some(did)) => header.push(format!("From: {did}")),
        (None, None) => {}
    }

    if let Some(uri) = event.metadata.get("uri").and_then(|v| v.as_str()) {
        header.push(format!("Post: {uri}"));
    }
    if let Some(cid) = event.metadata.get("cid").and_then(|v| v.as_str()) {
        header.push(format!("CID: {cid}"));
    }

    if let Some(reply_to) = event.metadata.get("reply_to").and_then(|v| v.as_object()) {
        if let Some(v) = reply_to.get("parent_uri").and_then(|v| v.as_str()) {
            header.push(format!("Parent URI: {v}"));
        }
        if let Some(v) = reply_to.get("parent_cid").and_then(|v| v.as_str()) {
            header.push(format!("Parent CID: {v}"));
        }
        if let Some(v) = reply_to.get("root_uri").and_then(|v| v.as_str()) {
            header.push(format!("Root URI: {v}"));
        }
        if let Some(v) = reply_to.get("root_cid").and_then(|v| v.as_str()) {
            header.push(format!("Root CID: {v}"));
        }
    }

    header.push(format!(
        "Time: {}",
        event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    ));

    format!(
        "{}\n\n{}\n\n{}",
        header.join("\n"),
        event.content,
        instructions_block()
    )
}

fn instructions_block() -> String {
    "[Instructions: this message was produced by an external event, not a \
direct conversation with a user. Use memory_read / memory_write to consult \
or update what you know about this source before responding, and \
execute_code for anything that needs the sandbox. Reply with whatever \
action is appropriate for this event; a reply is not always required.]"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Map};

    fn event_with(metadata: Map<String, serde_json::Value>) -> ExternalEvent {
        ExternalEvent {
            source: "atproto".to_string(),
            content: "hey, can you check the weather?".to_string(),
            metadata,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn renders_handle_and_did_when_both_present() {
        let mut meta = Map::new();
        meta.insert("handle".to_string(), json!("alice.bsky.social"));
        meta.insert("did".to_string(), json!("did:plc:abc123"));
        let rendered = format_event(&event_with(meta));
        assert!(rendered.starts_with("[External Event: atproto]"));
        assert!(rendered.contains("From: @alice.bsky.social (did:plc:abc123)"));
        assert!(rendered.contains("weather"));
        assert!(rendered.contains("[Instructions:"));
    }

    #[test]
    fn tolerates_missing_optional_metadata() {
        let rendered = format_event(&event_with(Map::new()));
        assert!(!rendered.contains("From:"));
        assert!(rendered.contains("[External Event: atproto]"));
    }

    #[test]
    fn renders_reply_chain_fields() {
        let mut reply_to = Map::new();
        reply_to.insert("parent_uri".to_string(), json!("at://p"));
        reply_to.insert("root_uri".to_string(), json!("at://r"));
        let mut meta = Map::new();
        meta.insert("reply_to".to_string(), serde_json::Value::Object(reply_to));
        let rendered = format_event(&event_with(meta));
        assert!(rendered.contains("Parent URI: at://p"));
        assert!(rendered.contains("Root URI: at://r"));
    }
}

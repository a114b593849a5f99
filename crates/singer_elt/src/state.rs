//! Tracking of the STATE messages a Singer target echoes on stdout once it has persisted
//! everything before them.

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct StateMessage {
    #[serde(rename = "type")]
    kind: String,
    value: Option<Value>,
}

/// Returns the `value` of a Singer `STATE` message, or `None` for any other line.
pub fn parse_state_line(line: &[u8]) -> Option<Value> {
    let message: StateMessage = serde_json::from_slice(line).ok()?;
    if message.kind != "STATE" {
        return None;
    }
    message.value
}

/// Consumes loader stdout lines until the sender side is dropped and keeps the last state.
pub(crate) async fn collect_final_state(mut rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Option<Value> {
    let mut last = None;
    while let Some(line) = rx.recv().await {
        if let Some(value) = parse_state_line(&line) {
            debug!("loader acknowledged state");
            last = Some(value);
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_state_messages_only() {
        assert_eq!(
            parse_state_line(br#"{"type":"STATE","value":{"bookmarks":{"users":{"id":3}}}}"#),
            Some(json!({"bookmarks": {"users": {"id": 3}}}))
        );
        assert_eq!(
            parse_state_line(br#"{"type":"RECORD","stream":"users","record":{}}"#),
            None
        );
        assert_eq!(parse_state_line(b"target done\n"), None);
    }

    #[tokio::test]
    async fn keeps_last_state() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(br#"{"type":"STATE","value":{"n":1}}"#.to_vec()).unwrap();
        tx.send(b"noise\n".to_vec()).unwrap();
        tx.send(b"{\"type\":\"STATE\",\"value\":{\"n\":2}}\n".to_vec())
            .unwrap();
        drop(tx);
        assert_eq!(collect_final_state(rx).await, Some(json!({"n": 2})));
    }
}

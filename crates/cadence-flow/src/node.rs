use std::collections::HashMap;

use chrono::Duration;

use cadence_core::error::{FlowError, Result};
use cadence_core::types::{FlowNode, HttpRequest, NodeKind};

/// Typed view of a node's `data` map.
///
/// Flow definitions arrive as free-form JSON from the editor; each node's
/// configuration is parsed into this enum before dispatch so that executors
/// work with total, type-checked inputs instead of probing the map.
#[derive(Debug, Clone)]
pub enum NodeAction {
    Trigger,
    SendMessage { text: String },
    AiAgent { agent_id: String },
    WaitReply,
    Delay { duration: Duration },
    Condition { expression: String },
    HumanHandoff { reason: Option<String> },
    Tag { tags: Vec<String> },
    HttpRequest(HttpRequest),
    Close,
    TransferAgent { agent_id: String },
    CheckWindow,
}

impl NodeAction {
    /// Parse a node's configuration. Returns a validation error naming the
    /// missing or malformed field.
    pub fn parse(node: &FlowNode) -> Result<Self> {
        let data = &node.data;
        match node.kind {
            NodeKind::Trigger => Ok(Self::Trigger),
            NodeKind::SendMessage => {
                let text = get_str(data, "message")
                    .or_else(|| get_str(data, "text"))
                    .ok_or_else(|| invalid(node, "missing message text"))?;
                Ok(Self::SendMessage { text })
            }
            NodeKind::AiAgent => {
                let agent_id = get_str(data, "agentId")
                    .ok_or_else(|| invalid(node, "missing agentId"))?;
                Ok(Self::AiAgent { agent_id })
            }
            NodeKind::WaitReply => Ok(Self::WaitReply),
            NodeKind::Delay => {
                let value = data
                    .get("value")
                    .and_then(|v| v.as_f64())
                    .filter(|v| *v >= 0.0)
                    .ok_or_else(|| invalid(node, "missing or negative delay value"))?;
                let unit = get_str(data, "unit").unwrap_or_else(|| "minutes".to_string());
                let secs = match unit.as_str() {
                    "seconds" => value,
                    "minutes" => value * 60.0,
                    "hours" => value * 3600.0,
                    "days" => value * 86400.0,
                    other => {
                        return Err(invalid(node, &format!("unknown delay unit '{}'", other)))
                    }
                };
                Ok(Self::Delay {
                    duration: Duration::seconds(secs as i64),
                })
            }
            NodeKind::Condition => {
                let expression = get_str(data, "condition")
                    .or_else(|| get_str(data, "expression"))
                    .ok_or_else(|| invalid(node, "missing condition expression"))?;
                Ok(Self::Condition { expression })
            }
            NodeKind::HumanHandoff => Ok(Self::HumanHandoff {
                reason: get_str(data, "reason"),
            }),
            NodeKind::Tag => {
                let tags: Vec<String> = match data.get("tags") {
                    Some(serde_json::Value::Array(items)) => items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(str::to_string)
                        .collect(),
                    _ => get_str(data, "tag").into_iter().collect(),
                };
                if tags.is_empty() {
                    return Err(invalid(node, "no tags configured"));
                }
                Ok(Self::Tag { tags })
            }
            NodeKind::HttpRequest => {
                let url =
                    get_str(data, "url").ok_or_else(|| invalid(node, "missing url"))?;
                let method = get_str(data, "method").unwrap_or_else(|| "GET".to_string());
                let headers = match data.get("headers") {
                    Some(serde_json::Value::Object(map)) => map
                        .iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect(),
                    _ => HashMap::new(),
                };
                Ok(Self::HttpRequest(HttpRequest {
                    method,
                    url,
                    headers,
                    body: data.get("body").cloned(),
                }))
            }
            NodeKind::Close => Ok(Self::Close),
            NodeKind::TransferAgent => {
                let agent_id = get_str(data, "agentId")
                    .ok_or_else(|| invalid(node, "missing agentId"))?;
                Ok(Self::TransferAgent { agent_id })
            }
            NodeKind::CheckWindow => Ok(Self::CheckWindow),
        }
    }
}

fn get_str(data: &HashMap<String, serde_json::Value>, key: &str) -> Option<String> {
    data.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn invalid(node: &FlowNode, message: &str) -> FlowError {
    FlowError::Validation(format!("node {} ({}): {}", node.id, node.kind, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_send_message() {
        let node = FlowNode::new("n1", NodeKind::SendMessage).with_data("message", json!("Hi!"));
        match NodeAction::parse(&node).unwrap() {
            NodeAction::SendMessage { text } => assert_eq!(text, "Hi!"),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_parse_send_message_missing_text() {
        let node = FlowNode::new("n1", NodeKind::SendMessage);
        let err = NodeAction::parse(&node).unwrap_err();
        assert!(err.to_string().contains("missing message text"));
    }

    #[test]
    fn test_parse_delay_units() {
        let cases = [
            ("seconds", 30.0, 30),
            ("minutes", 5.0, 300),
            ("hours", 2.0, 7200),
            ("days", 1.0, 86400),
        ];
        for (unit, value, expected_secs) in cases {
            let node = FlowNode::new("d", NodeKind::Delay)
                .with_data("value", json!(value))
                .with_data("unit", json!(unit));
            match NodeAction::parse(&node).unwrap() {
                NodeAction::Delay { duration } => {
                    assert_eq!(duration.num_seconds(), expected_secs, "unit {}", unit)
                }
                other => panic!("unexpected action: {:?}", other),
            }
        }
    }

    #[test]
    fn test_parse_delay_rejects_bad_unit() {
        let node = FlowNode::new("d", NodeKind::Delay)
            .with_data("value", json!(1))
            .with_data("unit", json!("fortnights"));
        assert!(NodeAction::parse(&node).is_err());
    }

    #[test]
    fn test_parse_tags_array_and_single() {
        let node = FlowNode::new("t", NodeKind::Tag).with_data("tags", json!(["vip", "lead"]));
        match NodeAction::parse(&node).unwrap() {
            NodeAction::Tag { tags } => assert_eq!(tags, vec!["vip", "lead"]),
            other => panic!("unexpected action: {:?}", other),
        }

        let node = FlowNode::new("t", NodeKind::Tag).with_data("tag", json!("vip"));
        match NodeAction::parse(&node).unwrap() {
            NodeAction::Tag { tags } => assert_eq!(tags, vec!["vip"]),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_parse_http_request() {
        let node = FlowNode::new("h", NodeKind::HttpRequest)
            .with_data("method", json!("POST"))
            .with_data("url", json!("https://api.example.com/hook"))
            .with_data("headers", json!({"x-api-key": "k"}))
            .with_data("body", json!({"ok": true}));
        match NodeAction::parse(&node).unwrap() {
            NodeAction::HttpRequest(req) => {
                assert_eq!(req.method, "POST");
                assert_eq!(req.url, "https://api.example.com/hook");
                assert_eq!(req.headers.get("x-api-key").map(String::as_str), Some("k"));
                assert_eq!(req.body, Some(json!({"ok": true})));
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_parse_http_defaults_to_get() {
        let node =
            FlowNode::new("h", NodeKind::HttpRequest).with_data("url", json!("https://x.test"));
        match NodeAction::parse(&node).unwrap() {
            NodeAction::HttpRequest(req) => assert_eq!(req.method, "GET"),
            other => panic!("unexpected action: {:?}", other),
        }
    }
}

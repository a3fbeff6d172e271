use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The accumulating key/value bag threaded through a run's node executions.
///
/// Seeded from trigger data, extended by each node's result. Keys are
/// strings; values are JSON for maximum flexibility — node types contribute
/// arbitrary keys, so this stays a dynamic map rather than a sum type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunContext {
    data: HashMap<String, serde_json::Value>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context from initial data.
    pub fn from_map(data: HashMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    /// Set a string value.
    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    /// Merge a map of values into this context (overwrites on conflict).
    pub fn merge(&mut self, other: &HashMap<String, serde_json::Value>) {
        for (k, v) in other {
            self.data.insert(k.clone(), v.clone());
        }
    }

    /// Resolve a dot-notation path (`contact.profile.tier`) into nested
    /// objects. Traversal through a missing or non-object intermediate
    /// yields `None`.
    pub fn lookup(&self, path: &str) -> Option<&serde_json::Value> {
        let mut parts = path.split('.');
        let mut current = self.data.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// JS-like truthiness of a context key (dot paths supported):
    /// null/false/0/"" are false, everything else present is true.
    pub fn truthy(&self, path: &str) -> bool {
        match self.lookup(path) {
            Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(serde_json::Value::String(s)) => !s.is_empty(),
            Some(_) => true,
            None => false,
        }
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let mut ctx = RunContext::new();
        ctx.set_str("name", "Alice");
        ctx.set("count", serde_json::json!(42));

        assert_eq!(ctx.get_str("name"), Some("Alice"));
        assert_eq!(ctx.get("count"), Some(&serde_json::json!(42)));
        assert_eq!(ctx.get("missing"), None);
    }

    #[test]
    fn test_merge_overwrites() {
        let mut ctx = RunContext::new();
        ctx.set_str("a", "1");
        ctx.set_str("b", "2");

        let mut extra = HashMap::new();
        extra.insert("b".to_string(), serde_json::json!("overwritten"));
        extra.insert("c".to_string(), serde_json::json!("3"));
        ctx.merge(&extra);

        assert_eq!(ctx.get_str("a"), Some("1"));
        assert_eq!(ctx.get_str("b"), Some("overwritten"));
        assert_eq!(ctx.get_str("c"), Some("3"));
    }

    #[test]
    fn test_dot_path_lookup() {
        let mut ctx = RunContext::new();
        ctx.set(
            "contact",
            serde_json::json!({"profile": {"tier": "gold"}, "name": "David"}),
        );

        assert_eq!(
            ctx.lookup("contact.profile.tier"),
            Some(&serde_json::json!("gold"))
        );
        assert_eq!(ctx.lookup("contact.name"), Some(&serde_json::json!("David")));
        assert_eq!(ctx.lookup("contact.missing.deep"), None);
        // Traversal through a non-object never panics
        assert_eq!(ctx.lookup("contact.name.deeper"), None);
    }

    #[test]
    fn test_truthiness() {
        let mut ctx = RunContext::new();
        ctx.set("flag", serde_json::json!(true));
        ctx.set("zero", serde_json::json!(0));
        ctx.set("empty", serde_json::json!(""));
        ctx.set("word", serde_json::json!("hello"));
        ctx.set("null", serde_json::Value::Null);
        ctx.set("list", serde_json::json!([1]));

        assert!(ctx.truthy("flag"));
        assert!(!ctx.truthy("zero"));
        assert!(!ctx.truthy("empty"));
        assert!(ctx.truthy("word"));
        assert!(!ctx.truthy("null"));
        assert!(ctx.truthy("list"));
        assert!(!ctx.truthy("absent"));
    }

    #[test]
    fn test_serde_transparent() {
        let mut ctx = RunContext::new();
        ctx.set_str("aiResponse", "hello");
        let json = serde_json::to_string(&ctx).unwrap();
        assert_eq!(json, r#"{"aiResponse":"hello"}"#);
        let back: RunContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get_str("aiResponse"), Some("hello"));
    }
}

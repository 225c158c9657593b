use std::sync::Arc;

use serde_json::Value;

/// Turns a payload into the text blob stored in the `data` column.
///
/// The queue converts payloads to [`serde_json::Value`] first, so a custom
/// serializer only decides the textual form. The default is canonical JSON.
pub type Serializer = Arc<dyn Fn(&Value) -> serde_json::Result<String> + Send + Sync>;

/// The default serializer: compact JSON with object keys in sorted order.
pub(crate) fn json() -> Serializer {
    Arc::new(|value| serde_json::to_string(value))
}

/// The payload given to jobs materialised from a cron schedule.
pub(crate) fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_serializer_emits_canonical_json() {
        let serializer = json();
        let text = serializer(&json!({"b": 2, "a": 1})).unwrap();
        assert_eq!(text, r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn empty_object_serializes_to_empty_braces() {
        let serializer = json();
        assert_eq!(serializer(&empty_object()).unwrap(), "{}");
    }
}

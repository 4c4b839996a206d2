//! `${VAR}` / `$VAR` environment-variable expansion (§4.1).
//!
//! Expansion happens only in the in-memory view returned by `load()`; the
//! original unexpanded text is what gets written back by `save()`.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

fn var_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap())
}

/// Expand `${VAR}` and `$VAR` references in `text` against the process
/// environment. Unknown variables are left untouched rather than erased, so
/// a typo doesn't silently produce an empty value.
pub fn expand_str(text: &str) -> String {
    var_pattern()
        .replace_all(text, |caps: &regex::Captures| {
            let name = caps.get(1).or_else(|| caps.get(2)).unwrap().as_str();
            match std::env::var(name) {
                Ok(value) => value,
                Err(_) => caps.get(0).unwrap().as_str().to_string(),
            }
        })
        .into_owned()
}

/// Recursively expand every string leaf in a JSON value.
pub fn expand_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(expand_str(s)),
        Value::Array(items) => Value::Array(items.iter().map(expand_value).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), expand_value(v));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Expand every string value in a flat map, useful for `ServerConfig.env`.
pub fn expand_map(map: &HashMap<String, String>) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), expand_str(v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn expands_braced_and_bare_forms() {
        std::env::set_var("MCPHUB_TEST_VAR", "value123");
        assert_eq!(expand_str("${MCPHUB_TEST_VAR}"), "value123");
        assert_eq!(expand_str("$MCPHUB_TEST_VAR"), "value123");
        assert_eq!(expand_str("prefix-$MCPHUB_TEST_VAR-suffix"), "prefix-value123-suffix");
        std::env::remove_var("MCPHUB_TEST_VAR");
    }

    #[test]
    #[serial]
    fn leaves_unknown_variables_untouched() {
        std::env::remove_var("MCPHUB_DOES_NOT_EXIST");
        assert_eq!(expand_str("${MCPHUB_DOES_NOT_EXIST}"), "${MCPHUB_DOES_NOT_EXIST}");
    }

    #[test]
    #[serial]
    fn expands_nested_json_values() {
        std::env::set_var("MCPHUB_TEST_NESTED", "nested-value");
        let value = serde_json::json!({
            "a": "${MCPHUB_TEST_NESTED}",
            "b": ["x", "$MCPHUB_TEST_NESTED"],
        });
        let expanded = expand_value(&value);
        assert_eq!(expanded["a"], "nested-value");
        assert_eq!(expanded["b"][1], "nested-value");
        std::env::remove_var("MCPHUB_TEST_NESTED");
    }
}

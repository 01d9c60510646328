use serde_json::{Map, Value};

/// Request parameters as the caller supplied them
pub type Params = Map<String, Value>;

/// Parameter names whose values never appear in reports or logs
const REDACTED_KEYS: &[&str] = &["access_token", "client_secret", "appsecret_proof", "fb_exchange_token"];

const REDACTED: &str = "[REDACTED]";

/// Flatten parameters into the string pairs sent on the wire.
///
/// Strings go as-is, numbers and booleans as their literal text, arrays and
/// objects as compact JSON. Nulls are dropped.
pub fn canonicalize(params: &Params) -> Vec<(String, String)> {
    params
        .iter()
        .filter_map(|(key, value)| {
            let encoded = match value {
                Value::Null => return None,
                Value::String(s) => s.clone(),
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                Value::Array(_) | Value::Object(_) => value.to_string(),
            };
            Some((key.clone(), encoded))
        })
        .collect()
}

/// Copy of `params` safe to echo back to the caller
pub fn redact(params: &Params) -> Params {
    params
        .iter()
        .map(|(key, value)| {
            if REDACTED_KEYS.contains(&key.as_str()) {
                (key.clone(), Value::String(REDACTED.to_string()))
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_canonicalize_scalars_and_structures() {
        let pairs = canonicalize(&params(json!({
            "fields": "id,name",
            "limit": 25,
            "is_dynamic": false,
            "targeting": {"geo_locations": {"countries": ["US", "CA"]}},
            "special_ad_categories": [],
            "after": null
        })));

        assert_eq!(
            pairs,
            vec![
                ("fields".to_string(), "id,name".to_string()),
                ("limit".to_string(), "25".to_string()),
                ("is_dynamic".to_string(), "false".to_string()),
                (
                    "targeting".to_string(),
                    r#"{"geo_locations":{"countries":["US","CA"]}}"#.to_string()
                ),
                ("special_ad_categories".to_string(), "[]".to_string()),
            ]
        );
    }

    #[test]
    fn test_redact_hides_credentials_only() {
        let redacted = redact(&params(json!({
            "access_token": "EAAB-secret",
            "fields": "id"
        })));

        assert_eq!(redacted["access_token"], "[REDACTED]");
        assert_eq!(redacted["fields"], "id");
    }
}

use crate::graph::{ApiError, ErrorReport, Params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What every tool hands back to the agent: `{"success": ...}` or the
/// normalized `{"error": ..., "details": ..., "params_sent": ...}` report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResult {
    Success { success: Value },
    Error(ErrorReport),
}

impl ToolResult {
    pub fn success(payload: Value) -> Self {
        ToolResult::Success { success: payload }
    }

    pub fn error(report: ErrorReport) -> Self {
        ToolResult::Error(report)
    }

    pub fn from_error(err: &ApiError, params: &Params) -> Self {
        ToolResult::Error(err.report(params))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolResult::Success { .. })
    }

    pub fn to_json_string(&self) -> String {
        // Serializing plain JSON values can't fail
        serde_json::to_string_pretty(self).unwrap_or_else(|e| {
            format!(r#"{{"error":"Failed to serialize result: {}"}}"#, e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_success_shape() {
        let result = ToolResult::success(json!({"id": "120210"}));
        let value = serde_json::to_value(&result).unwrap();

        assert_eq!(value, json!({"success": {"id": "120210"}}));
        assert!(result.is_success());
    }

    #[test]
    fn test_error_shape() {
        let params = json!({"fields": "id", "access_token": "EAAB"})
            .as_object()
            .unwrap()
            .clone();
        let result = ToolResult::from_error(&ApiError::Network("reset".into()), &params);
        let value = serde_json::to_value(&result).unwrap();

        assert!(value["error"].is_string());
        assert!(value["details"].is_object());
        assert_eq!(value["params_sent"]["fields"], "id");
        assert_eq!(value["params_sent"]["access_token"], "[REDACTED]");
        assert!(!result.is_success());

        let parsed: ToolResult = serde_json::from_value(value).unwrap();
        match parsed {
            ToolResult::Error(report) => assert_eq!(report.kind, ErrorKind::NetworkError),
            other => panic!("Expected error, got {:?}", other),
        }
    }
}

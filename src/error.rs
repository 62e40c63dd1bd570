//! Render failure taxonomy and the simplified error shape sent to clients.

use serde::Serialize;
use serde_json::Value;

/// Everything that can make a render fail.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The environment configuration is unusable. Raised at construction.
    #[error("Invalid environment configuration: {0}")]
    ConfigInvalid(String),

    /// A listed file could not be fetched.
    #[error("Unable to retrieve {url}. {reason}")]
    ResourceNotFound { url: String, reason: String },

    /// The resource loader gave no answer for a listed file.
    #[error("Unable to retrieve {url}. ResourceLoader returned null.")]
    ResourceLoaderViolation { url: String },

    /// None of the executed scripts called the registration function.
    #[error("no render callback was registered")]
    NoRenderCallback,

    /// The render function resolved to something other than `{body, status, headers}`.
    #[error("Malformed render result: {0}")]
    MalformedResult(String),

    /// Guest code threw while executing or rendering.
    #[error("{message}")]
    UserRenderException {
        message: String,
        stack: Option<String>,
    },

    #[error("Render timed out after {0}ms")]
    Timeout(u64),

    /// The sandbox engine itself failed.
    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

impl RenderError {
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::ConfigInvalid(_) => "ConfigInvalid",
            RenderError::ResourceNotFound { .. } => "ResourceNotFound",
            RenderError::ResourceLoaderViolation { .. } => "ResourceLoaderViolation",
            RenderError::NoRenderCallback => "NoRenderCallback",
            RenderError::MalformedResult(_) => "MalformedResult",
            RenderError::UserRenderException { .. } => "UserRenderException",
            RenderError::Timeout(_) => "Timeout",
            RenderError::Engine(_) => "Engine",
        }
    }

    pub fn stack(&self) -> Option<&str> {
        match self {
            RenderError::UserRenderException { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }
}

/// Maximum nesting followed when unwrapping `.error` members
const MAX_DEPTH: usize = 16;

/// `{error, stack}` as reported to callers of a failed render.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorInfo {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorInfo {
    /// Simplify an arbitrary JSON error value.
    ///
    /// Strings become the message. Objects are unwrapped through nested
    /// `error` members down to the innermost error-like object, which supplies
    /// `message`/`error` and `stack`.
    pub fn from_value(value: &Value) -> Self {
        simplify(value, 0)
    }
}

fn simplify(value: &Value, depth: usize) -> ErrorInfo {
    match value {
        Value::String(message) => ErrorInfo {
            error: message.clone(),
            stack: None,
        },
        Value::Object(map) => {
            if depth < MAX_DEPTH {
                if let Some(inner @ (Value::Object(_) | Value::String(_))) = map.get("error") {
                    let mut info = simplify(inner, depth + 1);
                    if info.stack.is_none() {
                        info.stack = map.get("stack").and_then(Value::as_str).map(String::from);
                    }
                    return info;
                }
            }
            let error = map
                .get("message")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| value.to_string());
            ErrorInfo {
                error,
                stack: map.get("stack").and_then(Value::as_str).map(String::from),
            }
        }
        Value::Null => ErrorInfo {
            error: "Unknown error".to_string(),
            stack: None,
        },
        other => ErrorInfo {
            error: other.to_string(),
            stack: None,
        },
    }
}

impl From<&RenderError> for ErrorInfo {
    fn from(err: &RenderError) -> Self {
        match err {
            RenderError::UserRenderException { message, stack } => ErrorInfo {
                error: message.clone(),
                stack: stack.clone(),
            },
            RenderError::Engine(inner) => ErrorInfo {
                error: format!("{:#}", inner),
                stack: None,
            },
            other => ErrorInfo {
                error: other.to_string(),
                stack: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_messages() {
        let err = RenderError::ResourceLoaderViolation {
            url: "a.js".to_string(),
        };
        assert_eq!(err.to_string(), "Unable to retrieve a.js. ResourceLoader returned null.");
        assert_eq!(
            RenderError::NoRenderCallback.to_string(),
            "no render callback was registered"
        );
        assert!(RenderError::MalformedResult("missing status".into())
            .to_string()
            .starts_with("Malformed render result"));
    }

    #[test]
    fn test_simplify_string() {
        let info = ErrorInfo::from_value(&json!("boom"));
        assert_eq!(info.error, "boom");
        assert_eq!(info.stack, None);
    }

    #[test]
    fn test_simplify_nested_error() {
        let info = ErrorInfo::from_value(&json!({
            "error": { "error": { "message": "deep", "stack": "at x" } }
        }));
        assert_eq!(info.error, "deep");
        assert_eq!(info.stack.as_deref(), Some("at x"));
    }

    #[test]
    fn test_simplify_depth_is_bounded() {
        let mut value = json!({ "message": "bottom" });
        for _ in 0..40 {
            value = json!({ "error": value });
        }
        let info = ErrorInfo::from_value(&value);
        assert!(info.error.contains("bottom"));
    }

    #[test]
    fn test_from_render_error_keeps_stack() {
        let err = RenderError::UserRenderException {
            message: "Error: kaput".to_string(),
            stack: Some("Error: kaput\n    at render (app.js:1:1)".to_string()),
        };
        let info = ErrorInfo::from(&err);
        assert_eq!(info.error, "Error: kaput");
        assert!(info.stack.unwrap().contains("app.js"));

        let body = serde_json::to_value(ErrorInfo::from(&RenderError::NoRenderCallback)).unwrap();
        assert_eq!(body, json!({ "error": "no render callback was registered" }));
    }
}

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use hub_agent::HubError;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub request_id: String,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub fn status_for(err: &HubError) -> StatusCode {
    match err {
        HubError::NotFound(_) => StatusCode::NOT_FOUND,
        HubError::InvalidProject(_) => StatusCode::BAD_REQUEST,
        HubError::OracleFailure(_) | HubError::SpawnFailure { .. } => StatusCode::BAD_GATEWAY,
        HubError::TunnelUrlTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        HubError::Config(_) | HubError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &str,
        message: impl Into<String>,
        request_id: &str,
    ) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
            hint: None,
            request_id: request_id.to_string(),
        }
    }

    pub fn from_hub(err: HubError, request_id: &str) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::warn!(code = err.code(), request_id, error = %err, "request failed");
        }
        Self {
            hint: err.hint().map(|h| truncate_utf8(h, MAX_HINT_BYTES)),
            ..Self::new(status, err.code(), err.to_string(), request_id)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_taxonomy_to_status() {
        assert_eq!(status_for(&HubError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&HubError::InvalidProject("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&HubError::spawn("pm2", "No such file or directory")),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&HubError::TunnelUrlTimeout {
                name: "api".into(),
                timeout_ms: 30_000
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&HubError::Config("bad".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn body_carries_code_hint_and_request_id() {
        let err = ApiError::from_hub(HubError::spawn("ngrok", "not found"), "req-1");
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["code"], "spawn_failed");
        assert_eq!(v["requestId"], "req-1");
        assert!(v["hint"].is_string());
        assert!(v.get("status").is_none());
    }

    #[test]
    fn hint_is_omitted_when_absent() {
        let v = serde_json::to_value(ApiError::from_hub(HubError::NotFound("api".into()), "r"))
            .unwrap();
        assert!(v.get("hint").is_none());
        assert_eq!(v["message"], "project not found: api");
    }

    #[test]
    fn long_messages_are_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_MESSAGE_BYTES);
        let err = ApiError::new(StatusCode::BAD_GATEWAY, "oracle_failure", long, "r");
        assert!(err.message.len() <= MAX_MESSAGE_BYTES);
        assert!(err.message.ends_with("…(truncated)"));
    }
}

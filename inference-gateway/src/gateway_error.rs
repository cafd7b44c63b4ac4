//! HTTP response mapping for engine errors.
//!
//! Wraps `inference_engine::EngineError` and converts it to the uniform
//! JSON error payload via `ErrorPayload`, with the status code chosen by
//! the error's category (admission -> 4xx, provider/unavailable -> 503,
//! fatal internal -> 500).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use inference_engine::EngineError;
use serde_json::json;

pub struct GatewayError(pub EngineError);

impl From<EngineError> for GatewayError {
    fn from(err: EngineError) -> Self {
        GatewayError(err)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let payload = inference_engine::ErrorPayload::from(&self.0);
        let status = match &self.0 {
            EngineError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            _ => match payload.kind {
                "admission_error" => StatusCode::TOO_MANY_REQUESTS,
                "routing_error" => StatusCode::SERVICE_UNAVAILABLE,
                "provider_error" => StatusCode::BAD_GATEWAY,
                "pipeline_error" => StatusCode::UNPROCESSABLE_ENTITY,
                "cancellation" => StatusCode::REQUEST_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };

        let body = Json(json!({
            "error": {
                "code": payload.code,
                "type": payload.kind,
                "message": payload.message,
                "retryable": payload.retryable,
                "origin_node": payload.origin_node,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn admission_errors_map_to_429() {
        let err = EngineError::QuotaExceeded { tenant_id: "t1".to_string() };
        let response = GatewayError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}

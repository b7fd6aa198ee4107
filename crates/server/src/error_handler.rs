// Copyright © 2026 Kirky.X
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::models::ErrorResponse;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use stockpile_core::types::CoreError;

fn status_for(error: &CoreError) -> StatusCode {
    match error {
        CoreError::InvalidPattern(_) | CoreError::Configuration(_) => StatusCode::BAD_REQUEST,
        CoreError::JobNotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Connection(_) | CoreError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn handle_core_error(error: CoreError) -> Response {
    let status = status_for(&error);
    if status.is_server_error() {
        tracing::error!("Request failed: {}", error);
    }
    let response = ErrorResponse::new(status.as_u16() as i32, error.to_string());
    (status, Json(response)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_pattern_is_bad_request() {
        let response = handle_core_error(CoreError::InvalidPattern("a*b".to_string()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_unknown_job_is_not_found() {
        let response = handle_core_error(CoreError::JobNotFound("nightly".to_string()));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_connection_error_is_unavailable() {
        let response = handle_core_error(CoreError::Timeout(2000));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_internal_error() {
        let response = handle_core_error(CoreError::Internal("boom".to_string()));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

//! Tests for `AppError` → HTTP response mapping.
//!
//! These call `IntoResponse` directly on `AppError` values; no server is
//! involved.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use http_body_util::BodyExt;
use stormforge_api::error::AppError;
use stormforge_core::admission::{AdmissionError, PolicyRejection};
use stormforge_core::error::CoreError;
use stormforge_core::quota::QuotaRejection;
use stormforge_db::StoreError;

/// Helper: convert an `AppError` into its status code and parsed JSON body.
async fn error_to_response(err: AppError) -> (StatusCode, serde_json::Value) {
    let response = err.into_response();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    (status, json)
}

// ---------------------------------------------------------------------------
// Core errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn not_found_error_returns_404() {
    let err = AppError::Core(CoreError::NotFound {
        entity: "Job",
        id: "abc".into(),
    });

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");
    assert_eq!(json["error"], "Job with id abc not found");
    assert!(json.get("reason").is_none());
}

#[tokio::test]
async fn conflict_error_returns_409() {
    let err = AppError::Core(CoreError::Conflict("Job is already completed".into()));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "CONFLICT");
}

#[tokio::test]
async fn internal_error_is_sanitized() {
    let err = AppError::InternalError("pipe to /usr/sbin/hping3 broke".into());

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["code"], "INTERNAL_ERROR");
    assert!(!json["error"].as_str().unwrap().contains("hping3"));
}

// ---------------------------------------------------------------------------
// Admission errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn validation_failure_returns_400() {
    let err = AppError::Admission(AdmissionError::Validation("pps: must be between 1 and 10000".into()));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn target_rejection_returns_403_with_reason() {
    let err = AppError::Admission(AdmissionError::Policy(PolicyRejection::TargetRejected {
        target: "8.8.8.8".into(),
        reason: "not in allow list".into(),
    }));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["code"], "TARGET_REJECTED");
    assert_eq!(json["reason"], "target_rejected");
    assert_eq!(json["error"], "target 8.8.8.8 rejected: not in allow list");
}

#[tokio::test]
async fn quota_rejection_returns_429_with_specific_reason() {
    let err = AppError::Admission(AdmissionError::Policy(PolicyRejection::Quota(
        QuotaRejection::RateWindowExceeded {
            limit: 20,
            window_secs: 60,
        },
    )));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json["code"], "QUOTA_EXCEEDED");
    assert_eq!(json["reason"], "rate_window_exceeded");
}

#[tokio::test]
async fn halted_system_returns_503() {
    let err = AppError::Admission(AdmissionError::Policy(PolicyRejection::SystemHalted));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["reason"], "system_halted");
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn store_row_not_found_returns_404() {
    let err = AppError::Store(StoreError::Database(sqlx::Error::RowNotFound));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");
}

#[tokio::test]
async fn invalid_stored_record_returns_500() {
    let err = AppError::Store(StoreError::InvalidRecord("bad cidr 'x'".into()));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "An internal error occurred");
}

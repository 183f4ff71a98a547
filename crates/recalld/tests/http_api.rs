//! Route-level tests through `tower::ServiceExt::oneshot` on the router.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::{Harness, TOKEN};
use recalld::build_router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const BOUNDARY: &str = "recall-test-boundary";

/// A multipart field: `(name, filename, bytes)`.
type Part<'a> = (&'a str, Option<&'a str>, &'a str);

fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, filename, data) in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match filename {
            Some(f) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            ),
        }
        body.extend_from_slice(data.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload(uri: &str, token: Option<&str>, parts: &[Part<'_>]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(multipart_body(parts))).unwrap()
}

fn get(uri: &str, method: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, TOKEN)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn app_with_faces() -> (Harness, Router) {
    let h = Harness::new().await.with_alice_and_bob().await;
    let app = build_router(Arc::clone(&h.state));
    (h, app)
}

#[tokio::test]
async fn test_health_reports_model_state() {
    let h = Harness::new().await;
    let app = build_router(Arc::clone(&h.state));

    let (status, body) = send(&app, get("/health", "GET")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["model_loaded"], false);
}

#[tokio::test]
async fn test_identify_returns_best_match() {
    let (_h, app) = app_with_faces().await;

    let (status, body) = send(
        &app,
        upload("/identify", Some(TOKEN), &[("image", Some("frame.jpg"), "0.0")]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "message": "Face identification completed",
            "identified_people": [{ "person_name": "Alice", "confidence": "85.00%" }],
        })
    );
}

#[tokio::test]
async fn test_identify_outcome_messages() {
    let (_h, app) = app_with_faces().await;

    let (_, body) = send(
        &app,
        upload("/identify", Some(TOKEN), &[("image", Some("f.jpg"), "noface")]),
    )
    .await;
    assert_eq!(body["message"], "No face detected");

    let (_, body) = send(
        &app,
        upload("/identify", Some(TOKEN), &[("image", Some("f.jpg"), "0.95")]),
    )
    .await;
    assert_eq!(body["message"], "No known faces identified");

    let (status, body) = send(&app, upload("/identify", Some(TOKEN), &[])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "No image uploaded");

    let (status, body) = send(
        &app,
        upload("/identify", Some(TOKEN), &[("image", Some("f.jpg"), "not-an-image")]),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["message"].as_str().unwrap().starts_with("Error processing image"));
}

#[tokio::test]
async fn test_identify_with_empty_registry() {
    let h = Harness::new().await;
    let app = build_router(Arc::clone(&h.state));

    let (status, body) = send(
        &app,
        upload("/identify", Some(TOKEN), &[("image", Some("f.jpg"), "0.0")]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "No registered faces to compare");
}

#[tokio::test]
async fn test_missing_and_unknown_credentials_rejected() {
    let (_h, app) = app_with_faces().await;

    let (status, _) = send(
        &app,
        upload("/identify", None, &[("image", Some("f.jpg"), "0.0")]),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        upload("/identify", Some("stolen"), &[("image", Some("f.jpg"), "0.0")]),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_enroll_names_and_face_detection() {
    let h = Harness::new().await;
    let app = build_router(Arc::clone(&h.state));

    let (status, body) = send(
        &app,
        upload("/faces", Some(TOKEN), &[("image", Some("Carol.png"), "0.3")]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["person_name"], "Carol");
    assert_eq!(body["face_detected"], true);
    assert_eq!(body["message"], "Face for Carol registered successfully");

    let (status, body) = send(
        &app,
        upload(
            "/faces",
            Some(TOKEN),
            &[
                ("image", Some("IMG_0042.jpg"), "noface"),
                ("person_name", None, "Grandpa Joe"),
            ],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["person_name"], "Grandpa Joe");
    assert_eq!(body["face_detected"], false);

    let (status, body) = send(
        &app,
        upload("/faces", Some(TOKEN), &[("image", Some("noextension"), "0.3")]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Person name is required");
}

#[tokio::test]
async fn test_bulk_enroll_reports_per_file_status() {
    let h = Harness::new().await;
    let app = build_router(Arc::clone(&h.state));

    let (status, body) = send(
        &app,
        upload(
            "/faces/bulk",
            Some(TOKEN),
            &[
                ("files", Some("Alice.jpg"), "0.15"),
                ("files", Some("Nobody.jpg"), "noface"),
                ("files", Some("Broken"), "garbage"),
            ],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Processed 3 images");

    let statuses: Vec<(&str, &str)> = body["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| {
            (
                r["person_name"].as_str().unwrap(),
                r["status"].as_str().unwrap(),
            )
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("Alice", "success"),
            ("Nobody", "no_face_detected"),
            ("Broken", "failed"),
        ]
    );
}

#[tokio::test]
async fn test_list_and_delete() {
    let h = Harness::new().await;
    let app = build_router(Arc::clone(&h.state));

    let (_, body) = send(&app, get("/faces", "GET")).await;
    assert_eq!(body["message"], "No faces registered yet");

    send(
        &app,
        upload("/faces", Some(TOKEN), &[("image", Some("Alice.jpg"), "0.15")]),
    )
    .await;

    let (status, body) = send(&app, get("/faces", "GET")).await;
    assert_eq!(status, StatusCode::OK);
    let faces = body["registered_faces"].as_array().unwrap();
    assert_eq!(faces.len(), 1);
    assert_eq!(faces[0]["person_name"], "Alice");
    // "%Y-%m-%d %H:%M"
    assert_eq!(faces[0]["created_at"].as_str().unwrap().len(), 16);

    let (status, body) = send(&app, get("/faces/Alice", "DELETE")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Face for Alice deleted successfully");

    let (status, body) = send(&app, get("/faces/Alice", "DELETE")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "No face registered for Alice");
}

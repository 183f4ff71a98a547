//! HTTP API.
//!
//! Each endpoint is a thin axum handler over an inner function returning
//! `(StatusCode, Value)`, so the logic is testable without a server.
//!
//! Endpoints:
//! - GET    /health                 liveness and model state
//! - POST   /faces                  enroll one face (multipart `image`, `person_name`)
//! - POST   /faces/bulk             enroll every uploaded file, named after the file
//! - GET    /faces                  list enrolled faces
//! - DELETE /faces/:person_name     remove an enrollment
//! - POST   /identify               identify the faces in one image
//! - GET    /ws/face-recognition    live recognition stream (see `gateway`)

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use recall_core::ProbeResult;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::engine::Identification;
use crate::error::EngineError;
use crate::gateway;
use crate::identity::{parse_credential, IdentityVerifier, Owner};
use crate::pipeline::Recognition;

const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// Shared state for every handler and stream connection.
pub struct AppState {
    pub recognition: Recognition,
    pub verifier: Arc<dyn IdentityVerifier>,
    /// Frames a stream connection may have waiting before new ones are dropped.
    pub stream_queue_depth: usize,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/faces", post(enroll_handler).get(list_handler))
        .route("/faces/bulk", post(bulk_enroll_handler))
        .route("/faces/:person_name", delete(delete_handler))
        .route("/identify", post(identify_handler))
        .route("/ws/face-recognition", get(gateway::ws_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Bind `listen_addr` and serve until `shutdown` resolves.
pub async fn serve(
    state: Arc<AppState>,
    listen_addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(state);
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!("recall API listening on http://{}", listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;
    Ok(())
}

// ============================================================================
// Authentication
// ============================================================================

/// The caller resolved from the `Authorization` header.
pub struct Authenticated(pub Owner);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(parse_credential);

        let Some(token) = token else {
            return Err(unauthorized("Authentication credentials were not provided"));
        };
        match state.verifier.verify(token).await {
            Some(owner) => Ok(Self(owner)),
            None => Err(unauthorized("Invalid authentication token")),
        }
    }
}

fn unauthorized(message: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::UNAUTHORIZED, Json(json!({ "message": message })))
}

// ============================================================================
// Uploads
// ============================================================================

/// One uploaded file from a multipart form.
#[derive(Debug, Clone)]
pub struct Upload {
    pub field: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// A decoded multipart form: files plus plain text fields.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub files: Vec<Upload>,
    pub fields: HashMap<String, String>,
}

impl UploadForm {
    pub async fn read(mut multipart: Multipart) -> Result<Self, String> {
        let mut form = UploadForm::default();
        while let Some(field) = multipart.next_field().await.map_err(|e| e.to_string())? {
            let name = field.name().unwrap_or_default().to_string();
            let filename = field.file_name().map(str::to_string);
            let data = field.bytes().await.map_err(|e| e.to_string())?;
            match filename {
                Some(filename) => form.files.push(Upload {
                    field: name,
                    filename,
                    bytes: data.to_vec(),
                }),
                None => {
                    form.fields
                        .insert(name, String::from_utf8_lossy(&data).into_owned());
                }
            }
        }
        Ok(form)
    }

    /// The file uploaded under `field`, ignoring empty uploads.
    pub fn take_file(&mut self, field: &str) -> Option<Upload> {
        let idx = self
            .files
            .iter()
            .position(|f| f.field == field && !f.bytes.is_empty())?;
        Some(self.files.swap_remove(idx))
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

/// File name with its last extension removed; `None` when there is no extension.
pub fn strip_extension(filename: &str) -> Option<&str> {
    filename
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .filter(|stem| !stem.is_empty())
}

// ============================================================================
// Response helpers
// ============================================================================

/// A match as shown to clients.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IdentifiedPerson {
    pub person_name: String,
    pub confidence: String,
}

impl From<&ProbeResult> for IdentifiedPerson {
    fn from(r: &ProbeResult) -> Self {
        Self {
            person_name: r.person_name.clone(),
            confidence: r.confidence_label(),
        }
    }
}

pub fn identified_people(results: &[ProbeResult]) -> Vec<IdentifiedPerson> {
    results.iter().map(IdentifiedPerson::from).collect()
}

pub fn error_status(e: &EngineError) -> StatusCode {
    match e {
        EngineError::Extraction(_) => StatusCode::INTERNAL_SERVER_ERROR,
        EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        EngineError::ModelLoad(_)
        | EngineError::ChannelClosed
        | EngineError::WorkerSpawn(_)
        | EngineError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error_response(e: &EngineError) -> (StatusCode, Value) {
    tracing::warn!(error = %e, "request failed");
    (error_status(e), json!({ "message": e.user_message() }))
}

fn message(status: StatusCode, text: impl Into<String>) -> (StatusCode, Value) {
    (status, json!({ "message": text.into() }))
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

pub fn health_inner(state: &AppState) -> (StatusCode, Value) {
    (
        StatusCode::OK,
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "model_loaded": state.recognition.lifecycle().is_loaded(),
        }),
    )
}

pub async fn identify_inner(
    recognition: &Recognition,
    owner: &Owner,
    mut form: UploadForm,
) -> (StatusCode, Value) {
    let Some(upload) = form.take_file("image") else {
        return message(StatusCode::BAD_REQUEST, "No image uploaded");
    };

    match recognition.identify(&owner.id, upload.bytes).await {
        Ok(Identification::NoFaceDetected) => message(StatusCode::OK, "No face detected"),
        Ok(Identification::NoRegisteredFaces) => {
            message(StatusCode::OK, "No registered faces to compare")
        }
        Ok(Identification::Matches(results)) if results.is_empty() => {
            message(StatusCode::OK, "No known faces identified")
        }
        Ok(Identification::Matches(results)) => (
            StatusCode::OK,
            json!({
                "message": "Face identification completed",
                "identified_people": identified_people(&results),
            }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn enroll_inner(
    recognition: &Recognition,
    owner: &Owner,
    mut form: UploadForm,
) -> (StatusCode, Value) {
    let Some(upload) = form.take_file("image") else {
        return message(StatusCode::BAD_REQUEST, "No image uploaded");
    };
    let person_name = match form.text("person_name") {
        Some(name) => name.to_string(),
        None => match strip_extension(&upload.filename) {
            Some(stem) => stem.to_string(),
            None => return message(StatusCode::BAD_REQUEST, "Person name is required"),
        },
    };

    match recognition
        .enroll(&owner.id, &person_name, &upload.filename, upload.bytes)
        .await
    {
        Ok(enrollment) => {
            let text = if enrollment.face_detected {
                format!("Face for {person_name} registered successfully")
            } else {
                "Image saved but no face was detected. Please try another image.".to_string()
            };
            (
                StatusCode::OK,
                json!({
                    "message": text,
                    "person_name": person_name,
                    "face_detected": enrollment.face_detected,
                    "image_path": enrollment.record.image_path,
                }),
            )
        }
        Err(e) => error_response(&e),
    }
}

pub async fn bulk_enroll_inner(
    recognition: &Recognition,
    owner: &Owner,
    form: UploadForm,
) -> (StatusCode, Value) {
    let uploads: Vec<Upload> = form.files.into_iter().filter(|f| !f.bytes.is_empty()).collect();
    if uploads.is_empty() {
        return message(StatusCode::BAD_REQUEST, "No images uploaded");
    }

    let mut results = Vec::with_capacity(uploads.len());
    for upload in uploads {
        let person_name = strip_extension(&upload.filename)
            .unwrap_or(&upload.filename)
            .to_string();
        let entry = match recognition
            .enroll(&owner.id, &person_name, &upload.filename, upload.bytes)
            .await
        {
            Ok(enrollment) => {
                let status = if enrollment.face_detected {
                    "success"
                } else {
                    "no_face_detected"
                };
                json!({
                    "person_name": person_name,
                    "status": status,
                    "image_path": enrollment.record.image_path,
                })
            }
            Err(e) => {
                tracing::warn!(owner = %owner.id, person = %person_name, error = %e, "bulk enrollment failed");
                json!({
                    "person_name": person_name,
                    "status": "failed",
                    "message": e.user_message(),
                })
            }
        };
        results.push(entry);
    }

    (
        StatusCode::OK,
        json!({
            "message": format!("Processed {} images", results.len()),
            "results": results,
        }),
    )
}

pub async fn list_inner(recognition: &Recognition, owner: &Owner) -> (StatusCode, Value) {
    let records = match recognition.list(&owner.id).await {
        Ok(records) => records,
        Err(e) => return error_response(&e),
    };
    if records.is_empty() {
        return message(StatusCode::OK, "No faces registered yet");
    }

    let faces: Vec<Value> = records
        .iter()
        .map(|r| {
            json!({
                "person_name": r.person_name,
                "face_detected": r.embedding.is_some(),
                "image_path": r.image_path,
                "created_at": r.enrolled_at.format("%Y-%m-%d %H:%M").to_string(),
            })
        })
        .collect();

    (
        StatusCode::OK,
        json!({
            "message": format!("Found {} registered faces", faces.len()),
            "registered_faces": faces,
        }),
    )
}

pub async fn delete_inner(
    recognition: &Recognition,
    owner: &Owner,
    person_name: &str,
) -> (StatusCode, Value) {
    match recognition.delete(&owner.id, person_name).await {
        Ok(true) => message(
            StatusCode::OK,
            format!("Face for {person_name} deleted successfully"),
        ),
        Ok(false) => message(
            StatusCode::NOT_FOUND,
            format!("No face registered for {person_name}"),
        ),
        Err(e) => error_response(&e),
    }
}

// ============================================================================
// Axum handler wrappers (thin wrappers over the inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state);
    (status, Json(body))
}

pub async fn identify_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(owner): Authenticated,
    multipart: Multipart,
) -> impl IntoResponse {
    let (status, body) = match UploadForm::read(multipart).await {
        Ok(form) => identify_inner(&state.recognition, &owner, form).await,
        Err(e) => message(StatusCode::BAD_REQUEST, format!("Invalid upload: {e}")),
    };
    (status, Json(body))
}

pub async fn enroll_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(owner): Authenticated,
    multipart: Multipart,
) -> impl IntoResponse {
    let (status, body) = match UploadForm::read(multipart).await {
        Ok(form) => enroll_inner(&state.recognition, &owner, form).await,
        Err(e) => message(StatusCode::BAD_REQUEST, format!("Invalid upload: {e}")),
    };
    (status, Json(body))
}

pub async fn bulk_enroll_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(owner): Authenticated,
    multipart: Multipart,
) -> impl IntoResponse {
    let (status, body) = match UploadForm::read(multipart).await {
        Ok(form) => bulk_enroll_inner(&state.recognition, &owner, form).await,
        Err(e) => message(StatusCode::BAD_REQUEST, format!("Invalid upload: {e}")),
    };
    (status, Json(body))
}

pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(owner): Authenticated,
) -> impl IntoResponse {
    let (status, body) = list_inner(&state.recognition, &owner).await;
    (status, Json(body))
}

pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(owner): Authenticated,
    Path(person_name): Path<String>,
) -> impl IntoResponse {
    let (status, body) = delete_inner(&state.recognition, &owner, &person_name).await;
    (status, Json(body))
}

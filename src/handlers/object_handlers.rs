//! HTTP handlers for object upload and retrieval.
//! Parses the upload form and delegates persistence to `StorageService`;
//! retrieval resolves the on-disk path and hands it to tower-http's file
//! service for range, conditional, and content-type handling.

use crate::{
    errors::AppError,
    services::storage_service::{StagedUpload, StorageService, StoreError},
};
use axum::{
    body::Body,
    extract::{Multipart, Path, Request, State, multipart::MultipartError},
    http::StatusCode,
    response::Response,
};
use futures::StreamExt;
use std::io::{self, ErrorKind};
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, error};

/// POST `/upload` — store one object from a multipart form.
///
/// Expects a binary `file` part plus `bucket` and `path` text fields, in
/// any order; only the first `file` part counts. The file part is staged
/// to disk as it arrives and committed once the whole form has parsed, so
/// an aborted request never leaves a partial object at the destination.
pub async fn upload_object(
    State(service): State<StorageService>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut staged: Option<StagedUpload> = None;
    let mut bucket: Option<String> = None;
    let mut declared_name: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                if let Some(upload) = staged.take() {
                    service.discard_staged(upload).await;
                }
                return Err(multipart_error(&err));
            }
        };

        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") if staged.is_none() => {
                let stream =
                    field.map(|chunk| chunk.map_err(|err| io::Error::new(ErrorKind::Other, err)));
                staged = Some(service.stage_object(stream).await.map_err(stage_failure)?);
            }
            Some(field_name @ ("bucket" | "path")) => {
                let text = match field.text().await {
                    Ok(text) => text,
                    Err(err) => {
                        if let Some(upload) = staged.take() {
                            service.discard_staged(upload).await;
                        }
                        return Err(multipart_error(&err));
                    }
                };
                if field_name == "bucket" {
                    bucket = Some(text);
                } else {
                    declared_name = Some(text);
                }
            }
            _ => {}
        }
    }

    let Some(staged_upload) = staged else {
        return Err(AppError::bad_request("Invalid file"));
    };
    let (bucket, declared_name) = match (bucket, declared_name) {
        (Some(bucket), Some(path)) => (bucket, path),
        _ => {
            service.discard_staged(staged_upload).await;
            return Err(AppError::bad_request(
                "upload form requires `bucket` and `path` fields",
            ));
        }
    };

    let size_bytes = staged_upload.size_bytes;
    let dest = service
        .commit_staged(staged_upload, &bucket, &declared_name)
        .await?;
    debug!(
        "stored {} bytes in bucket `{}` at {}",
        size_bytes,
        bucket,
        dest.display()
    );

    let mut response = Response::new(Body::from("File uploaded successfully."));
    *response.status_mut() = StatusCode::CREATED;
    Ok(response)
}

/// GET `/{bucket}/{*key}` — serve an object from disk.
///
/// Only the first segment of `key` names the object; anything after it is
/// ignored. Content-type inference, range and conditional headers, and the
/// missing-file 404 all come from `ServeFile`.
pub async fn get_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    request: Request,
) -> Result<Response, AppError> {
    let object = key.split('/').next().unwrap_or(&key);
    let path = service.resolve_object_path(&bucket, object).await?;

    let response = ServeFile::new(&path).oneshot(request).await.map_err(|err| {
        error!("serving object {}: {}", path.display(), err);
        AppError::internal("Error reading file")
    })?;
    Ok(response.map(Body::new))
}

/// GET `/{bucket}` — a retrieval path needs both a bucket and an object
/// name.
pub async fn get_incomplete_path() -> AppError {
    AppError::bad_request("Invalid request")
}

/// Map a multipart parse failure onto the upload contract. A body over the
/// configured ceiling surfaces from the multipart reader as 413 before the
/// rest of the body is buffered; the endpoint reports it as 400.
fn multipart_error(err: &MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        debug!("upload body exceeded the configured limit: {err}");
        AppError::bad_request("File too large")
    } else {
        debug!("invalid multipart upload body: {err}");
        AppError::bad_request("Invalid file")
    }
}

/// Staging errors triggered by the request stream wrap the multipart
/// failure (including a body-limit violation); unwrap it so the client
/// sees the right condition instead of a generic internal error.
fn stage_failure(err: StoreError) -> AppError {
    if let StoreError::Upload(io_err) = &err {
        if let Some(cause) = io_err
            .get_ref()
            .and_then(|src| src.downcast_ref::<MultipartError>())
        {
            return multipart_error(cause);
        }
    }
    AppError::from(err)
}

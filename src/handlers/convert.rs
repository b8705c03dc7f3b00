use crate::error::{AppError, ConversionError};
use crate::state::AppState;
use crate::tasks::dispatcher::DOWNLOAD_NOT_READY;
use crate::tasks::{TaskLookup, TaskRecord};
use actix_multipart::{Field, Multipart};
use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Multipart field carrying the upload.
pub const UPLOAD_FIELD: &str = "audiofile";

/// Accept an upload and start converting it.
///
/// ## Endpoint: `POST /upload`
///
/// ## Request:
/// Multipart form data with the file in a field named `audiofile`.
///
/// ## Response:
/// ```json
/// { "task_id": "4f7c0b8e-..." }
/// ```
pub async fn upload(state: web::Data<AppState>, mut payload: Multipart) -> Result<HttpResponse, AppError> {
    let mut saved: Option<SavedUpload> = None;

    if let Err(e) = receive_upload(&state, &mut payload, &mut saved).await {
        if let Some(upload) = &saved {
            remove_quietly(&upload.path).await;
        }
        return Err(e);
    }

    let Some(upload) = saved else {
        return Err(AppError::BadRequest("No file part".to_string()));
    };

    if upload.size == 0 {
        remove_quietly(&upload.path).await;
        let reason = ConversionError::EmptyUpload;
        state.dispatcher.reject(upload.task_id, &reason)?;
        return Err(AppError::BadRequest(reason.to_string()));
    }

    info!(task_id = %upload.task_id, size = upload.size, filename = %upload.display_name, "Upload saved");
    if let Err(e) = state
        .dispatcher
        .dispatch(upload.task_id, upload.path.clone(), upload.display_name)
    {
        remove_quietly(&upload.path).await;
        return Err(e.into());
    }

    Ok(HttpResponse::Ok().json(json!({ "task_id": upload.task_id })))
}

/// An `audiofile` field already written to the upload directory.
struct SavedUpload {
    task_id: Uuid,
    path: PathBuf,
    display_name: String,
    size: u64,
}

/// Walk every multipart field, saving the first `audiofile` into `saved`.
/// Anything saved stays recorded in `saved` even when a later field fails.
async fn receive_upload(
    state: &AppState,
    payload: &mut Multipart,
    saved: &mut Option<SavedUpload>,
) -> Result<(), AppError> {
    while let Some(item) = payload.next().await {
        let mut field: Field = item.map_err(|e| AppError::BadRequest(format!("Multipart error: {}", e)))?;

        let (field_name, filename) = match field.content_disposition() {
            Some(cd) => (
                cd.get_name().unwrap_or_default().to_string(),
                cd.get_filename().map(str::to_string),
            ),
            None => (String::new(), None),
        };

        if field_name != UPLOAD_FIELD || saved.is_some() {
            drain(&mut field).await?;
            continue;
        }

        let filename = filename.unwrap_or_default();
        if filename.is_empty() {
            return Err(AppError::BadRequest("No selected file".to_string()));
        }

        let task_id = Uuid::new_v4();
        let display_name = sanitize_filename(&filename);
        let path = state
            .config
            .storage
            .upload_dir
            .join(format!("{}_{}", task_id, display_name));

        let size = save_field(&mut field, &path, state.config.limits.max_upload_bytes).await?;
        *saved = Some(SavedUpload {
            task_id,
            path,
            display_name,
            size,
        });
    }

    Ok(())
}

/// Current state of a task.
///
/// ## Endpoint: `GET /status/{task_id}`
///
/// Always answers 200: either the task record (without its on-disk path)
/// or `{"status": "unknown"}`.
pub async fn status(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    let lookup = match Uuid::parse_str(&path.into_inner()) {
        Ok(task_id) => state.dispatcher.status(&task_id),
        Err(_) => TaskLookup::Unknown,
    };

    let body = match lookup {
        TaskLookup::Known(record) => status_body(&record)?,
        TaskLookup::Unknown => json!({ "status": "unknown" }),
    };

    Ok(HttpResponse::Ok().json(body))
}

fn status_body(record: &TaskRecord) -> Result<serde_json::Value, AppError> {
    let mut body = serde_json::to_value(record).map_err(|e| AppError::Internal(e.to_string()))?;
    if let Some(fields) = body.as_object_mut() {
        fields.remove("output_path");
        if record.error_kind().is_none() {
            fields.insert("progress".to_string(), json!(record.progress()));
        }
    }
    Ok(body)
}

/// Serve a converted file as an attachment.
///
/// ## Endpoint: `GET /download/{task_id}`
///
/// The task record is removed a while after a successful download.
pub async fn download(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    let task_id = Uuid::parse_str(&path.into_inner())
        .map_err(|_| AppError::NotFound(DOWNLOAD_NOT_READY.to_string()))?;

    let target = state.dispatcher.resolve_download(&task_id)?;
    let bytes = tokio::fs::read(&target.path).await.map_err(|e| {
        error!(task_id = %task_id, path = %target.path.display(), error = %e, "Failed to read output file");
        AppError::Internal(e.to_string())
    })?;

    state.dispatcher.schedule_cleanup(task_id);
    info!(task_id = %task_id, bytes = bytes.len(), "Serving converted file");

    Ok(HttpResponse::Ok()
        .content_type("audio/wav")
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(target.filename)],
        })
        .body(bytes))
}

/// Stream one multipart field to `path`, enforcing `limit` bytes.
async fn save_field(field: &mut Field, path: &Path, limit: u64) -> Result<u64, AppError> {
    let mut file = tokio::fs::File::create(path).await.map_err(|e| {
        error!(path = %path.display(), error = %e, "Upload directory is not writable");
        AppError::Internal(e.to_string())
    })?;

    let mut written: u64 = 0;
    while let Some(chunk) = field.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                remove_quietly(path).await;
                return Err(AppError::BadRequest(format!("Chunk error: {}", e)));
            }
        };

        written += chunk.len() as u64;
        if written > limit {
            drop(file);
            remove_quietly(path).await;
            warn!(limit, "Upload exceeds size limit");
            return Err(AppError::PayloadTooLarge(format!(
                "File exceeds the maximum upload size of {} bytes",
                limit
            )));
        }

        file.write_all(&chunk).await?;
    }

    file.flush().await?;
    Ok(written)
}

async fn drain(field: &mut Field) -> Result<(), AppError> {
    while let Some(chunk) = field.next().await {
        chunk.map_err(|e| AppError::BadRequest(format!("Chunk error: {}", e)))?;
    }
    Ok(())
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove upload");
    }
}

/// Reduce a client supplied filename to a safe single path component.
///
/// Keeps ASCII letters, digits, `.`, `-` and `_`; runs of anything else
/// (including path separators and whitespace) become one `_`. Leading and
/// trailing dots and underscores are dropped.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_separator = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            out.push(c);
        } else {
            pending_separator = true;
        }
    }

    let trimmed = out.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::test_support::write_tone_wav;
    use crate::audio::SymphoniaBackend;
    use crate::conversion::ConversionPipeline;
    use crate::state::test_support::test_state;
    use crate::tasks::store::test_support::FlakyStore;
    use crate::tasks::{DispatchSettings, Dispatcher, TaskStore};
    use std::sync::Arc;
    use actix_web::{http::StatusCode, test as actix_test, App};
    use std::time::Duration;

    const BOUNDARY: &str = "----audio-convert-test-boundary";

    fn multipart_body(field: &str, filename: &str, content: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                field, filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn upload_request(body: Vec<u8>) -> actix_test::TestRequest {
        actix_test::TestRequest::post()
            .uri("/upload")
            .insert_header((
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            ))
            .set_payload(body)
    }

    macro_rules! app {
        ($state:expr) => {
            actix_test::init_service(
                App::new()
                    .app_data(web::Data::new($state.clone()))
                    .route("/upload", web::post().to(upload))
                    .route("/status/{task_id}", web::get().to(status))
                    .route("/download/{task_id}", web::get().to(download)),
            )
            .await
        };
    }

    async fn wait_for_terminal(state: &AppState, id: &Uuid) {
        for _ in 0..200 {
            if state.store.get(id).is_some_and(|r| r.is_terminal()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {} never finished", id);
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("my song.mp3"), "my_song.mp3");
        assert_eq!(sanitize_filename("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_filename("voice-memo_01.wav"), "voice-memo_01.wav");
        assert_eq!(sanitize_filename("..."), "upload");
        assert_eq!(sanitize_filename("café.wav"), "caf_.wav");
    }

    #[actix_web::test]
    async fn test_unknown_status_is_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = app!(state);

        for id in [Uuid::new_v4().to_string(), "not-a-uuid".to_string()] {
            let req = actix_test::TestRequest::get().uri(&format!("/status/{}", id)).to_request();
            let resp = actix_test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::OK);
            let body: serde_json::Value = actix_test::read_body_json(resp).await;
            assert_eq!(body, json!({ "status": "unknown" }));
        }
    }

    #[actix_web::test]
    async fn test_upload_requires_file_part() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = app!(state);

        let resp = actix_test::call_service(&app, upload_request(multipart_body("other", "x.wav", b"abc")).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["error"]["message"], "No file part");
    }

    #[actix_web::test]
    async fn test_upload_requires_filename() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = app!(state);

        let resp = actix_test::call_service(&app, upload_request(multipart_body(UPLOAD_FIELD, "", b"abc")).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["error"]["message"], "No selected file");
    }

    #[actix_web::test]
    async fn test_empty_upload_is_rejected_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = app!(state);

        let resp = actix_test::call_service(&app, upload_request(multipart_body(UPLOAD_FIELD, "a.wav", b"")).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["error"]["message"], "Uploaded file is empty");

        let records = state.store.list_all();
        assert_eq!(records.len(), 1);
        assert!(records.values().all(|r| r.status() == "error"));
        assert_eq!(std::fs::read_dir(&state.config.storage.upload_dir).unwrap().count(), 0);
    }

    #[actix_web::test]
    async fn test_saved_upload_is_removed_when_a_later_part_fails() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = app!(state);

        // A complete audiofile part followed by a part that is cut off
        let mut body = multipart_body(UPLOAD_FIELD, "a.wav", b"RIFF....WAVE");
        body.truncate(body.len() - format!("--{}--\r\n", BOUNDARY).len());
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"extra\"\r\n\r\npartial");

        let resp = actix_test::call_service(&app, upload_request(body).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(state.store.list_all().is_empty());
        assert_eq!(std::fs::read_dir(&state.config.storage.upload_dir).unwrap().count(), 0);
    }

    #[actix_web::test]
    async fn test_saved_upload_is_removed_when_dispatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let base = test_state(dir.path());
        let config = (*base.config).clone();

        // The pending record cannot be written
        let store: Arc<dyn TaskStore> =
            Arc::new(FlakyStore::new(Arc::clone(&base.store)).fail_next_progress_puts(1));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::new(ConversionPipeline::new(Arc::new(SymphoniaBackend), config.target_profile())),
            Arc::clone(&base.supervisor),
            DispatchSettings {
                output_dir: config.storage.output_dir.clone(),
                task_timeout: None,
                download_grace: config.download_grace(),
            },
        ));
        let state = AppState::new(config, store, dispatcher, Arc::clone(&base.supervisor));
        let app = app!(state);

        let wav = write_tone_wav(&dir.path().join("tone.wav"), 1, 8000, 16, 0.1);
        let content = std::fs::read(&wav).unwrap();
        let resp = actix_test::call_service(&app, upload_request(multipart_body(UPLOAD_FIELD, "tone.wav", &content)).to_request()).await;

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(state.store.list_all().is_empty());
        assert_eq!(std::fs::read_dir(&state.config.storage.upload_dir).unwrap().count(), 0);
    }

    #[actix_web::test]
    async fn test_oversized_upload_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = app!(state);

        let big = vec![7u8; (state.config.limits.max_upload_bytes + 1) as usize];
        let resp = actix_test::call_service(&app, upload_request(multipart_body(UPLOAD_FIELD, "big.wav", &big)).to_request()).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(state.store.list_all().is_empty());
    }

    #[actix_web::test]
    async fn test_upload_poll_download_flow() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = app!(state);

        let wav = write_tone_wav(&dir.path().join("tone.wav"), 2, 16000, 16, 0.5);
        let content = std::fs::read(&wav).unwrap();

        let resp = actix_test::call_service(&app, upload_request(multipart_body(UPLOAD_FIELD, "my tone.wav", &content)).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        let task_id = Uuid::parse_str(body["task_id"].as_str().unwrap()).unwrap();

        wait_for_terminal(&state, &task_id).await;

        let req = actix_test::TestRequest::get().uri(&format!("/status/{}", task_id)).to_request();
        let status: serde_json::Value = actix_test::read_body_json(actix_test::call_service(&app, req).await).await;
        assert_eq!(status["status"], "complete");
        assert_eq!(status["progress"], 100);
        assert_eq!(status["filename"], "my_tone_mono_8khz_16bit.wav");
        assert_eq!(status["original_format"]["channels"], 2);
        assert!(status.get("output_path").is_none());

        let req = actix_test::TestRequest::get().uri(&format!("/download/{}", task_id)).to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let disposition = resp.headers().get("content-disposition").unwrap().to_str().unwrap().to_string();
        assert!(disposition.starts_with("attachment"));
        assert!(disposition.contains("my_tone_mono_8khz_16bit.wav"));
        let bytes = actix_test::read_body(resp).await;
        assert_eq!(&bytes[..4], b"RIFF");
    }

    #[actix_web::test]
    async fn test_download_before_completion_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = app!(state);

        let id = Uuid::new_v4();
        state.store.put(id, TaskRecord::processing(30)).unwrap();

        let req = actix_test::TestRequest::get().uri(&format!("/download/{}", id)).to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["error"]["message"], DOWNLOAD_NOT_READY);

        let req = actix_test::TestRequest::get().uri(&format!("/status/{}", id)).to_request();
        let status: serde_json::Value = actix_test::read_body_json(actix_test::call_service(&app, req).await).await;
        assert_eq!(status["status"], "processing");
        assert_eq!(status["progress"], 30);
    }
}

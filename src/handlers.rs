use crate::auth::{AuthProvider, SessionAuth};
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::*;
use crate::services::{ImageUpload, LinkService, ResolutionState, ViewSession};
use crate::storage::StorageError;
use crate::viewer::{error_page, not_found_page, VIEWER_JS};
use axum::{
    extract::{Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse},
    Json,
};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::sync::Arc;
use utoipa::OpenApi;

/// Everything but RFC 3986 unreserved characters is escaped in a path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub struct AppState {
    pub config: Config,
    pub links: LinkService,
    pub auth: SessionAuth,
}

#[derive(OpenApi)]
#[openapi(
    paths(health, sign_in, sign_out, me, upload, resolve_link),
    components(schemas(
        HealthResponse,
        SignInRequest,
        SignInResponse,
        SignOutResponse,
        PrincipalResponse,
        UploadResponse,
        ResolveResponse,
        Stage
    )),
    tags(
        (name = "panoview", description = "Shareable 360° panorama links")
    ),
    info(
        title = "panoview API",
        version = "0.1.0",
        description = "Upload a panorama, get a shareable link that opens it in a 360° viewer.\n\n\
                      ## Links\n\
                      - Links look like `<base>/view/<token>`\n\
                      - The token is the storage URL encrypted with AES-256-CBC, hex encoded\n\
                      - The server keeps no record of issued links\n\
                      - Viewers fetch images through `/3d/*`, never from storage directly\n\n\
                      ## Auth\n\
                      - Sign in with `/api/auth/sign-in` and send the token as `Authorization: Bearer <token>`",
        license(name = "MIT"),
    )
)]
pub struct ApiDoc;

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|token| !token.is_empty())
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    tag = "panoview",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        max_upload_size: state.config.max_upload_bytes,
    })
}

/// Sign in with a configured user and receive a bearer token
#[utoipa::path(
    post,
    path = "/api/auth/sign-in",
    tag = "panoview",
    request_body = SignInRequest,
    responses(
        (status = 200, description = "Signed in", body = SignInResponse),
        (status = 401, description = "Unknown user or wrong secret")
    )
)]
pub async fn sign_in(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignInRequest>,
) -> Result<Json<SignInResponse>> {
    let (token, principal) = state.auth.sign_in(&req.uid, &req.secret)?;

    Ok(Json(SignInResponse {
        token,
        uid: principal.uid,
    }))
}

/// End the session behind the bearer token
#[utoipa::path(
    post,
    path = "/api/auth/sign-out",
    tag = "panoview",
    responses(
        (status = 200, description = "Signed out", body = SignOutResponse),
        (status = 401, description = "No active session")
    )
)]
pub async fn sign_out(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SignOutResponse>> {
    let token = bearer_token(&headers).ok_or(AppError::AuthRequired)?;
    if !state.auth.sign_out(token) {
        return Err(AppError::AuthRequired);
    }

    Ok(Json(SignOutResponse { success: true }))
}

/// Current principal
#[utoipa::path(
    get,
    path = "/api/auth/me",
    tag = "panoview",
    responses(
        (status = 200, description = "Signed-in user", body = PrincipalResponse),
        (status = 401, description = "Not signed in")
    )
)]
pub async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<PrincipalResponse>> {
    let principal = state
        .auth
        .current_principal(bearer_token(&headers))
        .ok_or(AppError::AuthRequired)?;

    Ok(Json(PrincipalResponse {
        uid: principal.uid,
        signed_in_at: principal.signed_in_at,
    }))
}

/// Upload a panorama and receive a shareable link
///
/// The multipart `file` field must carry an image. The image is stored under
/// the caller's namespace and its storage URL is encrypted into the link token.
#[utoipa::path(
    post,
    path = "/api/upload",
    tag = "panoview",
    request_body(content = inline(Vec<u8>), description = "Multipart form with a `file` field holding the panorama", content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Link issued", body = UploadResponse),
        (status = 400, description = "Not an image"),
        (status = 401, description = "Sign in required"),
        (status = 409, description = "Another upload is still running"),
        (status = 413, description = "File too large"),
        (status = 500, description = "Upload failed")
    )
)]
pub async fn upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>> {
    // Check auth before reading any of the body
    let principal = state.auth.current_principal(bearer_token(&headers));
    if principal.is_none() {
        return Err(AppError::AuthRequired);
    }

    let max_upload_bytes = state.config.max_upload_bytes;

    // SECURITY: Validate Content-Length before loading any data into memory
    if let Some(content_length) = headers.get(header::CONTENT_LENGTH) {
        if let Ok(length_str) = content_length.to_str() {
            if let Ok(length) = length_str.parse::<usize>() {
                if length > max_upload_bytes + crate::constants::MULTIPART_OVERHEAD_BYTES {
                    return Err(AppError::PayloadTooLarge(format!(
                        "Content-Length {} exceeds maximum upload size of {} bytes",
                        length, max_upload_bytes
                    )));
                }
            }
        }
    }

    let mut image: Option<ImageUpload> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or("panorama").to_string();
        let content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await.map_err(multipart_error)?;

        if data.len() > max_upload_bytes {
            return Err(AppError::PayloadTooLarge(format!(
                "File too large (max {}MB)",
                max_upload_bytes / (1024 * 1024)
            )));
        }

        image = Some(ImageUpload {
            file_name,
            content_type,
            data,
        });
    }

    let image = image.ok_or_else(|| AppError::BadRequest("No file provided".to_string()))?;

    let mut stages = Vec::new();
    let issued = state
        .links
        .issue(principal.as_ref(), image, |stage| {
            tracing::debug!(%stage, "{}", stage.label());
            stages.push(stage);
        })
        .await?;

    Ok(Json(UploadResponse {
        link: issued.link,
        token: issued.token,
        stages,
    }))
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(e.body_text())
    } else {
        AppError::BadRequest(format!("Failed to parse multipart: {}", e))
    }
}

/// Resolve a link token to the URL the viewer loads
#[utoipa::path(
    get,
    path = "/api/links/{token}",
    tag = "panoview",
    params(
        ("token" = String, Path, description = "Hex token from a shareable link")
    ),
    responses(
        (status = 200, description = "Viewer URL", body = ResolveResponse),
        (status = 400, description = "Token could not be decoded (retryable)"),
        (status = 404, description = "Token does not point at a stored panorama")
    )
)]
pub async fn resolve_link(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<ResolveResponse>> {
    let viewer_url = state.links.resolve(Some(&token))?;
    Ok(Json(ResolveResponse { viewer_url }))
}

/// Shareable link target: the 360° viewer page
pub async fn view(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    let mut session = ViewSession::new(Some(token.clone()));

    session.load(&state.links);

    match session.state() {
        ResolutionState::Ready(viewer_url) => {
            (StatusCode::OK, Html(state.links.render(viewer_url)))
        }
        ResolutionState::Error(message) => {
            let retry_href = format!(
                "{}/{}",
                crate::constants::VIEW_PREFIX,
                utf8_percent_encode(&token, PATH_SEGMENT)
            );
            (StatusCode::BAD_REQUEST, Html(error_page(message, &retry_href)))
        }
        ResolutionState::NotFound | ResolutionState::Loading => {
            (StatusCode::NOT_FOUND, Html(not_found_page()))
        }
    }
}

/// `/view` without a token
pub async fn view_missing() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Html(not_found_page()))
}

/// `/3d/*path`: serve stored panoramas under the public site's origin
pub async fn proxy_object(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<impl IntoResponse> {
    let (object, data) = state.links.store().get(&path).await.map_err(|e| match e {
        StorageError::NotFound(_) | StorageError::InvalidPath(_) => AppError::NotFound,
        other => AppError::Storage(other),
    })?;

    // Only images are ever proxied, whatever else sits in storage
    let content_type = match object.content_type {
        Some(content_type) if content_type.starts_with("image/") => content_type,
        other => {
            tracing::warn!(path = %object.path, content_type = ?other, "Refused to proxy non-image object");
            return Err(AppError::NotFound);
        }
    };

    let mut headers = HeaderMap::new();
    if let Ok(value) = content_type.parse() {
        headers.insert(header::CONTENT_TYPE, value);
    }
    // Object paths are timestamped and never rewritten
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("public, max-age=31536000, immutable"),
    );

    Ok((headers, data))
}

pub async fn viewer_js() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
        VIEWER_JS,
    )
}

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use chrono::Utc;

use crate::auth::Principal;
use crate::codec::TokenCodec;
use crate::config::Config;
use crate::constants::{MAX_FILE_NAME_LEN, PROXY_PREFIX, STORAGE_NAMESPACE, VIEW_PREFIX};
use crate::error::{AppError, Result};
use crate::models::Stage;
use crate::storage::{validate_object_path, ObjectStore};
use crate::viewer::{Viewer, ViewerOptions};

/// Raw image as received from the client.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedLink {
    pub link: String,
    pub token: String,
}

pub struct LinkService {
    codec: TokenCodec,
    store: Arc<dyn ObjectStore>,
    viewer: Arc<dyn Viewer>,
    viewer_options: ViewerOptions,
    public_base_url: String,
    storage_public_url: String,
    in_flight: Mutex<HashSet<String>>,
}

/// Marks one principal's issuance as running until dropped.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    uid: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&self.uid);
        }
    }
}

impl LinkService {
    pub fn new(config: &Config, store: Arc<dyn ObjectStore>, viewer: Arc<dyn Viewer>) -> Self {
        Self {
            codec: TokenCodec::new(config.secrets.clone()),
            store,
            viewer,
            viewer_options: ViewerOptions::default(),
            public_base_url: config.public_base_url.clone(),
            storage_public_url: config.storage_public_url.clone(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Store an uploaded image and turn its canonical URL into a shareable link.
    ///
    /// Nothing is written to storage unless the caller is signed in and the
    /// upload is an image. A principal may only run one issuance at a time.
    pub async fn issue(
        &self,
        principal: Option<&Principal>,
        upload: ImageUpload,
        mut on_stage: impl FnMut(Stage) + Send,
    ) -> Result<IssuedLink> {
        let principal = principal.ok_or(AppError::AuthRequired)?;
        let _guard = self.begin_issuance(&principal.uid)?;

        let content_type = image_content_type(&upload)?;
        let extensions = image_extensions(&content_type)?;

        on_stage(Stage::Preparing);
        let path = object_path(
            &principal.uid,
            &upload.file_name,
            extensions,
            Utc::now().timestamp_millis(),
        );
        let object = self
            .store
            .put(&path, upload.data, Some(content_type.as_str()))
            .await?;
        let canonical_url = self.store.canonical_url(&object);

        on_stage(Stage::Securing);
        let token = self.codec.encode(&canonical_url);

        on_stage(Stage::Finalizing);
        let link = self.share_link(&token);

        on_stage(Stage::Complete);
        tracing::info!(
            uid = %principal.uid,
            path = %object.path,
            bytes = object.size_bytes,
            content_type = ?object.content_type,
            "Issued shareable link"
        );

        Ok(IssuedLink { link, token })
    }

    pub fn share_link(&self, token: &str) -> String {
        format!("{}{}/{}", self.public_base_url, VIEW_PREFIX, token)
    }

    /// Turn a link token back into the proxied URL the viewer should load.
    pub fn resolve(&self, token: Option<&str>) -> Result<String> {
        let token = token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AppError::NotFound)?;

        let decoded = self.codec.decode(token)?;
        self.canonicalize(&decoded).ok_or_else(|| {
            tracing::debug!("Decoded token does not point into storage");
            AppError::NotFound
        })
    }

    /// Rewrite a canonical storage URL onto the local `/3d/` proxy.
    pub fn canonicalize(&self, decoded: &str) -> Option<String> {
        let rest = decoded
            .strip_prefix(self.storage_public_url.as_str())?
            .strip_prefix('/')?;
        if rest.contains(['?', '#']) || validate_object_path(rest).ok()? != rest {
            return None;
        }

        Some(format!("{}{}/{}", self.public_base_url, PROXY_PREFIX, rest))
    }

    pub fn render(&self, viewer_url: &str) -> String {
        self.viewer.render(viewer_url, &self.viewer_options)
    }

    fn begin_issuance(&self, uid: &str) -> Result<InFlightGuard<'_>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| anyhow::anyhow!("in-flight upload registry poisoned"))?;

        if !in_flight.insert(uid.to_string()) {
            tracing::warn!(uid, "Rejected concurrent upload");
            return Err(AppError::UploadInProgress);
        }

        Ok(InFlightGuard {
            in_flight: &self.in_flight,
            uid: uid.to_string(),
        })
    }
}

/// Media type of an upload, which must be an image.
fn image_content_type(upload: &ImageUpload) -> Result<String> {
    let content_type = upload
        .content_type
        .as_deref()
        .and_then(|ct| ct.split(';').next())
        .map(str::trim)
        .filter(|ct| !ct.is_empty() && *ct != "application/octet-stream")
        .map(str::to_ascii_lowercase)
        .or_else(|| {
            mime_guess::from_path(&upload.file_name)
                .first()
                .map(|mime| mime.essence_str().to_string())
        });

    match content_type {
        Some(ct) if ct.starts_with("image/") => {
            if upload.data.is_empty() {
                return Err(AppError::InvalidInput("The uploaded image is empty".to_string()));
            }
            Ok(ct)
        }
        _ => Err(AppError::InvalidInput("Please upload an image file".to_string())),
    }
}

/// File extensions that carry `content_type`; images without one cannot be served back.
fn image_extensions(content_type: &str) -> Result<&'static [&'static str]> {
    mime_guess::get_mime_extensions_str(content_type)
        .filter(|extensions| !extensions.is_empty())
        .ok_or_else(|| AppError::InvalidInput(format!("Unsupported image type {}", content_type)))
}

/// `3d-views/<uid>/<millis>-<name>`, with the name reduced to URL-safe characters
/// and ending in one of `extensions`.
fn object_path(uid: &str, file_name: &str, extensions: &[&str], timestamp_millis: i64) -> String {
    let base_name = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    let mut name: String = base_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILE_NAME_LEN)
        .collect();
    if name.trim_matches('.').is_empty() {
        name = "panorama".to_string();
    }

    let has_extension = name
        .rsplit_once('.')
        .is_some_and(|(_, ext)| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)));
    if !has_extension {
        if let Some(extension) = extensions.first() {
            name = format!("{}.{}", name.trim_end_matches('.'), extension);
        }
    }

    format!("{}/{}/{}-{}", STORAGE_NAMESPACE, uid, timestamp_millis, name)
}

/// Where a shared link currently stands on the viewing side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionState {
    Loading,
    Ready(String),
    Error(String),
    NotFound,
}

/// One visit to a shared link: `Loading -> Ready | Error | NotFound`, `Error -> Loading` on retry.
#[derive(Debug, Clone)]
pub struct ViewSession {
    token: Option<String>,
    state: ResolutionState,
}

impl ViewSession {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token,
            state: ResolutionState::Loading,
        }
    }

    pub fn state(&self) -> &ResolutionState {
        &self.state
    }

    /// Resolve the token if still loading; settled states are left alone.
    pub fn load(&mut self, links: &LinkService) -> &ResolutionState {
        if self.state != ResolutionState::Loading {
            return &self.state;
        }

        self.state = match links.resolve(self.token.as_deref()) {
            Ok(url) => ResolutionState::Ready(url),
            Err(AppError::NotFound) => ResolutionState::NotFound,
            Err(err) => {
                tracing::debug!("Link resolution failed: {}", err);
                ResolutionState::Error(err.to_string())
            }
        };
        &self.state
    }

    /// Re-run resolution after an error. Other states do not change.
    pub fn retry(&mut self, links: &LinkService) -> &ResolutionState {
        if matches!(self.state, ResolutionState::Error(_)) {
            self.state = ResolutionState::Loading;
            return self.load(links);
        }
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ObjectRef, StorageError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Notify;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    const IV_HEX: &str = "0f0e0d0c0b0a09080706050403020100";

    #[derive(Default)]
    struct MemoryStore {
        objects: Mutex<HashMap<String, (ObjectRef, Bytes)>>,
        fail_writes: bool,
        gate: Option<Arc<Notify>>,
    }

    impl MemoryStore {
        fn writes(&self) -> usize {
            self.objects.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn put(
            &self,
            path: &str,
            data: Bytes,
            content_type: Option<&str>,
        ) -> std::result::Result<ObjectRef, StorageError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_writes {
                return Err(StorageError::Io(std::io::Error::other("bucket unavailable")));
            }
            let object = ObjectRef {
                path: path.to_string(),
                size_bytes: data.len() as u64,
                content_type: content_type.map(str::to_string),
            };
            self.objects
                .lock()
                .unwrap()
                .insert(path.to_string(), (object.clone(), data));
            Ok(object)
        }

        fn canonical_url(&self, object: &ObjectRef) -> String {
            format!("https://storage.example/bucket/{}", object.path)
        }

        async fn get(&self, path: &str) -> std::result::Result<(ObjectRef, Bytes), StorageError> {
            self.objects
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(path.to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingViewer {
        rendered: Mutex<Vec<String>>,
    }

    impl Viewer for RecordingViewer {
        fn render(&self, url: &str, _options: &ViewerOptions) -> String {
            self.rendered.lock().unwrap().push(url.to_string());
            format!("<view {url}>")
        }
    }

    fn config() -> Config {
        Config::from_lookup(|key| {
            match key {
                "ENCRYPTION_KEY" => Some(KEY_HEX),
                "ENCRYPTION_IV" => Some(IV_HEX),
                "PUBLIC_BASE_URL" => Some("https://viewer-3d.vercel.app"),
                "STORAGE_PUBLIC_URL" => Some("https://storage.example/bucket"),
                _ => None,
            }
            .map(str::to_string)
        })
        .unwrap()
    }

    fn service_with(store: MemoryStore) -> (LinkService, Arc<MemoryStore>, Arc<RecordingViewer>) {
        let store = Arc::new(store);
        let viewer = Arc::new(RecordingViewer::default());
        let service = LinkService::new(&config(), store.clone(), viewer.clone());
        (service, store, viewer)
    }

    fn alice() -> Principal {
        Principal {
            uid: "alice".to_string(),
            signed_in_at: Utc::now(),
        }
    }

    fn jpeg(name: &str) -> ImageUpload {
        ImageUpload {
            file_name: name.to_string(),
            content_type: Some("image/jpeg".to_string()),
            data: Bytes::from_static(b"\xff\xd8\xff\xe0 panorama"),
        }
    }

    #[tokio::test]
    async fn upload_to_view_end_to_end() {
        let (service, store, viewer) = service_with(MemoryStore::default());
        let mut stages = Vec::new();

        let issued = service
            .issue(Some(&alice()), jpeg("photo.jpg"), |stage| stages.push(stage))
            .await
            .unwrap();

        assert_eq!(
            stages,
            vec![Stage::Preparing, Stage::Securing, Stage::Finalizing, Stage::Complete]
        );
        assert_eq!(store.writes(), 1);
        assert_eq!(
            issued.link,
            format!("https://viewer-3d.vercel.app/view/{}", issued.token)
        );

        let stored_path = store.objects.lock().unwrap().keys().next().cloned().unwrap();
        assert!(stored_path.starts_with("3d-views/alice/"));
        assert!(stored_path.ends_with("-photo.jpg"));

        let mut session = ViewSession::new(Some(issued.token.clone()));
        let expected = format!("https://viewer-3d.vercel.app/3d/{}", stored_path);
        assert_eq!(session.load(&service), &ResolutionState::Ready(expected.clone()));

        service.render(&expected);
        assert_eq!(*viewer.rendered.lock().unwrap(), vec![expected]);
    }

    #[tokio::test]
    async fn same_upload_path_gives_same_token() {
        let (service, _, _) = service_with(MemoryStore::default());
        let url = "https://storage.example/bucket/photo.jpg";
        let token = service.codec.encode(url);
        assert_eq!(token, service.codec.encode(url));
        assert_eq!(
            service.resolve(Some(&token)).unwrap(),
            "https://viewer-3d.vercel.app/3d/photo.jpg"
        );
    }

    #[tokio::test]
    async fn unauthenticated_upload_writes_nothing() {
        let (service, store, _) = service_with(MemoryStore::default());
        let mut stages = Vec::new();

        let result = service.issue(None, jpeg("photo.jpg"), |s| stages.push(s)).await;

        assert!(matches!(result, Err(AppError::AuthRequired)));
        assert_eq!(store.writes(), 0);
        assert!(stages.is_empty());
    }

    #[tokio::test]
    async fn non_image_upload_writes_nothing() {
        let (service, store, _) = service_with(MemoryStore::default());
        let upload = ImageUpload {
            file_name: "notes.txt".to_string(),
            content_type: Some("text/plain".to_string()),
            data: Bytes::from_static(b"hello"),
        };

        let result = service.issue(Some(&alice()), upload, |_| {}).await;

        assert!(matches!(result, Err(AppError::InvalidInput(_))));
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn media_type_falls_back_to_file_extension() {
        let (service, store, _) = service_with(MemoryStore::default());

        let mut upload = jpeg("room.png");
        upload.content_type = Some("application/octet-stream".to_string());
        assert!(service.issue(Some(&alice()), upload, |_| {}).await.is_ok());

        let mut upload = jpeg("archive.zip");
        upload.content_type = None;
        assert!(matches!(
            service.issue(Some(&alice()), upload, |_| {}).await,
            Err(AppError::InvalidInput(_))
        ));
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn storage_failure_returns_no_link() {
        let (service, _, _) = service_with(MemoryStore {
            fail_writes: true,
            ..MemoryStore::default()
        });
        let mut stages = Vec::new();

        let result = service
            .issue(Some(&alice()), jpeg("photo.jpg"), |s| stages.push(s))
            .await;

        assert!(matches!(result, Err(AppError::Storage(_))));
        assert_eq!(stages, vec![Stage::Preparing]);
    }

    #[tokio::test]
    async fn concurrent_upload_for_same_principal_is_rejected() {
        let gate = Arc::new(Notify::new());
        let (service, store, _) = service_with(MemoryStore {
            gate: Some(gate.clone()),
            ..MemoryStore::default()
        });
        let principal = alice();

        let (first, second, _) = tokio::join!(
            service.issue(Some(&principal), jpeg("one.jpg"), |_| {}),
            service.issue(Some(&principal), jpeg("two.jpg"), |_| {}),
            async {
                tokio::task::yield_now().await;
                gate.notify_one();
            }
        );

        assert!(first.is_ok());
        assert!(matches!(second, Err(AppError::UploadInProgress)));
        assert_eq!(store.writes(), 1);

        // The guard is released once the first upload finishes.
        gate.notify_one();
        assert!(service
            .issue(Some(&principal), jpeg("three.jpg"), |_| {})
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn failed_upload_releases_the_guard() {
        let (service, _, _) = service_with(MemoryStore::default());
        let principal = alice();
        let mut text = jpeg("notes.txt");
        text.content_type = Some("text/plain".to_string());

        assert!(service.issue(Some(&principal), text, |_| {}).await.is_err());
        assert!(service
            .issue(Some(&principal), jpeg("photo.jpg"), |_| {})
            .await
            .is_ok());
    }

    #[test]
    fn missing_token_is_not_found() {
        let (service, _, _) = service_with(MemoryStore::default());
        for token in [None, Some(""), Some("  ")] {
            let mut session = ViewSession::new(token.map(str::to_string));
            assert_eq!(session.load(&service), &ResolutionState::NotFound);
            assert_eq!(session.retry(&service), &ResolutionState::NotFound);
        }
    }

    #[test]
    fn garbled_token_is_a_retryable_error() {
        let (service, _, _) = service_with(MemoryStore::default());
        let mut session = ViewSession::new(Some("not-hex!!".to_string()));

        match session.load(&service) {
            ResolutionState::Error(message) => assert!(message.starts_with("Invalid URL-")),
            other => panic!("unexpected state {other:?}"),
        }

        // Retrying re-runs the same decode and lands in the same place.
        let first = session.state().clone();
        assert_eq!(session.retry(&service), &first);
    }

    #[test]
    fn ready_is_terminal() {
        let (service, _, _) = service_with(MemoryStore::default());
        let token = service
            .codec
            .encode("https://storage.example/bucket/3d-views/alice/1-pano.jpg");
        let mut session = ViewSession::new(Some(token));

        let ready = session.load(&service).clone();
        assert!(matches!(ready, ResolutionState::Ready(_)));
        assert_eq!(session.retry(&service), &ready);
        assert_eq!(session.load(&service), &ready);
    }

    #[test]
    fn urls_outside_storage_are_not_found() {
        let (service, _, _) = service_with(MemoryStore::default());
        for url in [
            "https://evil.example/bucket/pano.jpg",
            "https://storage.example/bucket",
            "https://storage.example/bucket/",
            "https://storage.example/bucketeer/pano.jpg",
            "https://storage.example/bucket/../secrets",
            "https://storage.example/bucket/pano.jpg?alt=media",
        ] {
            let token = service.codec.encode(url);
            assert!(
                matches!(service.resolve(Some(&token)), Err(AppError::NotFound)),
                "{url} resolved"
            );
        }
    }

    const JPEG: &[&str] = &["jpg", "jpeg"];

    #[test]
    fn object_paths_are_namespaced_and_sanitized() {
        assert_eq!(
            object_path("alice", "photo.jpg", JPEG, 1_700_000_000_000),
            "3d-views/alice/1700000000000-photo.jpg"
        );
        assert_eq!(
            object_path("alice", "C:\\Users\\me\\my pano #1.JPEG", JPEG, 5),
            "3d-views/alice/5-my_pano__1.JPEG"
        );
        assert_eq!(object_path("bob", "../..", JPEG, 7), "3d-views/bob/7-panorama.jpg");
        assert_eq!(object_path("bob", "", JPEG, 7), "3d-views/bob/7-panorama.jpg");
    }

    #[test]
    fn object_paths_end_in_the_checked_image_type() {
        assert_eq!(
            object_path("eve", "evil.html", &["png"], 9),
            "3d-views/eve/9-evil.html.png"
        );
        assert_eq!(object_path("eve", "evil.", &["png"], 9), "3d-views/eve/9-evil.png");
        assert_eq!(object_path("eve", "room", &["png"], 9), "3d-views/eve/9-room.png");
    }

    #[tokio::test]
    async fn declared_image_type_decides_the_stored_name() {
        let (service, store, _) = service_with(MemoryStore::default());
        let upload = ImageUpload {
            file_name: "evil.html".to_string(),
            content_type: Some("image/png; charset=binary".to_string()),
            data: Bytes::from_static(b"<script>alert(1)</script>"),
        };

        service.issue(Some(&alice()), upload, |_| {}).await.unwrap();

        let objects = store.objects.lock().unwrap();
        let (object, _) = objects.values().next().unwrap();
        assert!(object.path.ends_with("-evil.html.png"), "{}", object.path);
        assert_eq!(object.content_type.as_deref(), Some("image/png"));
    }
}

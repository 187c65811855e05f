//! S3-compatible durable store for uploaded videos.
//!
//! [`VideoStore`] connects lazily: the first call to
//! [`VideoStore::initialize`] or [`VideoStore::upload`] builds the client and
//! makes sure the destination bucket exists. Concurrent first callers wait on
//! the same initialization, so the store connects exactly once.

use std::path::Path;

use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

pub use aws_sdk_s3::primitives::ByteStream;

/// Region that must not be sent as an explicit location constraint.
const DEFAULT_REGION: &str = "us-east-1";

/// Length of the random component in generated blob names.
const UNIQUE_SUFFIX_LEN: usize = 8;

/// Connection settings for the object store.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Service endpoint, e.g. `https://s3.us-east-1.amazonaws.com` or a
    /// MinIO/Azurite-style gateway URL. Objects are addressed path-style
    /// beneath it.
    pub account_url: String,
    /// Bucket (container) holding uploaded videos.
    pub container: String,
    pub region: String,
}

/// Errors from the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The store is misconfigured, unreachable, rejected the request, or
    /// has been shut down.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

enum StoreState {
    Uninitialized,
    Ready(Client),
    Closed,
}

/// Handle to the durable store, shared across requests.
pub struct VideoStore {
    config: StorageConfig,
    sdk_config: Option<aws_config::SdkConfig>,
    state: Mutex<StoreState>,
}

impl VideoStore {
    /// Store that resolves credentials from the ambient AWS chain on first use.
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            sdk_config: None,
            state: Mutex::new(StoreState::Uninitialized),
        }
    }

    /// Store that connects with an already-loaded SDK configuration
    /// (explicit credentials, retry policy, ...). The endpoint still comes
    /// from `config`.
    pub fn with_sdk_config(config: StorageConfig, sdk_config: aws_config::SdkConfig) -> Self {
        Self {
            config,
            sdk_config: Some(sdk_config),
            state: Mutex::new(StoreState::Uninitialized),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Connect and ensure the bucket exists. Safe to call repeatedly.
    pub async fn initialize(&self) -> Result<(), StorageError> {
        self.client().await.map(|_| ())
    }

    /// Upload `body` under a fresh unique name derived from `filename`.
    ///
    /// Returns the object's URL. Failures are not retried.
    pub async fn upload(
        &self,
        body: ByteStream,
        filename: &str,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let client = self.client().await?;
        let key = blob_name(Utc::now(), filename);

        client
            .put_object()
            .bucket(&self.config.container)
            .key(&key)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(key = %key, error = %DisplayErrorContext(&e), "Blob upload failed");
                StorageError::Unavailable(format!("upload of {key} failed: {}", DisplayErrorContext(&e)))
            })?;

        tracing::info!(key = %key, container = %self.config.container, "Uploaded video to blob");
        Ok(self.blob_url(&key))
    }

    /// Stream the file at `path` to the store. See [`VideoStore::upload`].
    pub async fn upload_file(
        &self,
        path: &Path,
        filename: &str,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::Unavailable(format!("cannot read upload: {e}")))?;
        self.upload(body, filename, content_type).await
    }

    /// Path-style URL of `key` inside the configured bucket.
    pub fn blob_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.account_url.trim_end_matches('/'),
            self.config.container,
            key
        )
    }

    /// Release the client. Idempotent; a no-op when never initialized.
    /// Later uploads fail with [`StorageError::Unavailable`].
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, StoreState::Closed) {
            StoreState::Ready(client) => {
                drop(client);
                tracing::info!("Blob storage client closed");
            }
            StoreState::Uninitialized => {
                tracing::debug!("Blob storage closed before first use");
            }
            StoreState::Closed => {}
        }
    }

    async fn client(&self) -> Result<Client, StorageError> {
        let mut state = self.state.lock().await;
        match &*state {
            StoreState::Ready(client) => Ok(client.clone()),
            StoreState::Closed => Err(StorageError::Unavailable("store has been closed".into())),
            StoreState::Uninitialized => {
                let client = connect(&self.config, self.sdk_config.as_ref()).await;
                ensure_container(&client, &self.config).await;
                *state = StoreState::Ready(client.clone());
                tracing::info!(
                    account_url = %self.config.account_url,
                    container = %self.config.container,
                    "Blob storage initialized",
                );
                Ok(client)
            }
        }
    }
}

/// Build a client pointed at the configured endpoint, loading the ambient
/// AWS credential chain unless an SDK configuration was supplied.
async fn connect(config: &StorageConfig, sdk_config: Option<&aws_config::SdkConfig>) -> Client {
    let loaded;
    let sdk_config = match sdk_config {
        Some(sdk_config) => sdk_config,
        None => {
            loaded = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .load()
                .await;
            &loaded
        }
    };

    let s3_config = aws_sdk_s3::config::Builder::from(sdk_config)
        .endpoint_url(&config.account_url)
        .force_path_style(true)
        .build();

    Client::from_conf(s3_config)
}

/// Create the bucket when it does not exist yet.
///
/// Losing a creation race to another process is fine. Any other failure is
/// logged and left for the first upload to surface.
async fn ensure_container(client: &Client, config: &StorageConfig) {
    if client
        .head_bucket()
        .bucket(&config.container)
        .send()
        .await
        .is_ok()
    {
        return;
    }

    let mut request = client.create_bucket().bucket(&config.container);
    if config.region != DEFAULT_REGION {
        request = request.create_bucket_configuration(
            CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(config.region.as_str()))
                .build(),
        );
    }

    match request.send().await {
        Ok(_) => tracing::info!(container = %config.container, "Created container"),
        Err(e) => {
            let already_there = e
                .as_service_error()
                .map(|se| se.is_bucket_already_owned_by_you() || se.is_bucket_already_exists())
                .unwrap_or(false);
            if !already_there {
                tracing::warn!(
                    container = %config.container,
                    error = %DisplayErrorContext(&e),
                    "Container creation check failed",
                );
            }
        }
    }
}

/// Unique object key: `{YYYYmmdd-HHMMSS}-{8 hex chars}-{filename}`.
pub fn blob_name(now: DateTime<Utc>, filename: &str) -> String {
    let unique = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        now.format("%Y%m%d-%H%M%S"),
        &unique[..UNIQUE_SUFFIX_LEN],
        filename
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use aws_sdk_s3::config::Credentials;
    use axum::extract::State;
    use axum::http::{header, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{head, put};
    use axum::Router;
    use chrono::TimeZone;

    use super::*;

    // -----------------------------------------------------------------------
    // In-process S3 endpoint
    // -----------------------------------------------------------------------

    #[derive(Clone, Default)]
    struct MockS3 {
        bucket_exists: bool,
        deny_puts: bool,
        heads: Arc<AtomicUsize>,
        creates: Arc<AtomicUsize>,
        puts: Arc<AtomicUsize>,
    }

    fn s3_error(status: StatusCode, code: &str) -> Response {
        (
            status,
            [(header::CONTENT_TYPE, "application/xml")],
            format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <Error><Code>{code}</Code><Message>{code}</Message><RequestId>req-1</RequestId></Error>"
            ),
        )
            .into_response()
    }

    async fn head_bucket(State(s3): State<MockS3>) -> StatusCode {
        s3.heads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        if s3.bucket_exists {
            StatusCode::OK
        } else {
            StatusCode::NOT_FOUND
        }
    }

    async fn create_bucket(State(s3): State<MockS3>) -> Response {
        s3.creates.fetch_add(1, Ordering::SeqCst);
        s3_error(StatusCode::CONFLICT, "BucketAlreadyOwnedByYou")
    }

    async fn put_object(State(s3): State<MockS3>) -> Response {
        s3.puts.fetch_add(1, Ordering::SeqCst);
        if s3.deny_puts {
            return s3_error(StatusCode::FORBIDDEN, "AccessDenied");
        }
        (StatusCode::OK, [(header::ETAG, "\"0123456789abcdef\"")]).into_response()
    }

    async fn serve(s3: MockS3) -> String {
        let router = Router::new()
            .route("/{bucket}/", head(head_bucket).put(create_bucket))
            .route("/{bucket}/{*key}", put(put_object))
            .with_state(s3);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn store_at(endpoint: String) -> VideoStore {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(DEFAULT_REGION))
            .credentials_provider(Credentials::new("test", "test", None, None, "static"))
            .load()
            .await;
        VideoStore::with_sdk_config(
            StorageConfig {
                account_url: endpoint,
                container: "videos".into(),
                region: DEFAULT_REGION.into(),
            },
            sdk_config,
        )
    }

    fn store() -> VideoStore {
        VideoStore::new(StorageConfig {
            account_url: "http://localhost:9000/".into(),
            container: "videos".into(),
            region: DEFAULT_REGION.into(),
        })
    }

    // -----------------------------------------------------------------------
    // Connection and upload
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn concurrent_first_use_connects_once_and_accepts_existing_bucket() {
        let s3 = MockS3::default();
        let endpoint = serve(s3.clone()).await;
        let store = Arc::new(store_at(endpoint.clone()).await);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            tasks.spawn(async move { store.initialize().await });
        }
        while let Some(result) = tasks.join_next().await {
            assert_matches!(result.unwrap(), Ok(()));
        }

        assert_eq!(s3.heads.load(Ordering::SeqCst), 1);
        assert_eq!(s3.creates.load(Ordering::SeqCst), 1);

        let url = store
            .upload(ByteStream::from(b"video".to_vec()), "clip.mp4", "video/mp4")
            .await
            .unwrap();
        assert!(url.starts_with(&format!("{endpoint}/videos/")), "{url}");
        assert!(url.ends_with("-clip.mp4"), "{url}");
        assert_eq!(s3.puts.load(Ordering::SeqCst), 1);
        assert_eq!(s3.heads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn existing_bucket_is_not_recreated() {
        let s3 = MockS3 {
            bucket_exists: true,
            ..MockS3::default()
        };
        let store = store_at(serve(s3.clone()).await).await;

        store.initialize().await.unwrap();
        store.initialize().await.unwrap();

        assert_eq!(s3.heads.load(Ordering::SeqCst), 1);
        assert_eq!(s3.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_upload_is_unavailable() {
        let s3 = MockS3 {
            bucket_exists: true,
            deny_puts: true,
            ..MockS3::default()
        };
        let store = store_at(serve(s3.clone()).await).await;

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"video").unwrap();
        let result = store.upload_file(file.path(), "clip.mp4", "video/mp4").await;

        assert_matches!(result, Err(StorageError::Unavailable(msg)) if msg.contains("clip.mp4"));
        assert_eq!(s3.puts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blob_name_has_timestamp_suffix_and_filename() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let name = blob_name(now, "clip.mp4");

        assert!(name.starts_with("20240309-140507-"), "{name}");
        assert!(name.ends_with("-clip.mp4"), "{name}");
        let suffix = &name["20240309-140507-".len().."20240309-140507-".len() + UNIQUE_SUFFIX_LEN];
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()), "{suffix}");
    }

    #[test]
    fn repeated_uploads_of_same_file_never_collide() {
        let now = Utc::now();
        let names: HashSet<String> = (0..500).map(|_| blob_name(now, "clip.mp4")).collect();
        assert_eq!(names.len(), 500);
    }

    #[test]
    fn blob_url_is_path_style() {
        assert_eq!(
            store().blob_url("20240309-140507-abcd1234-clip.mp4"),
            "http://localhost:9000/videos/20240309-140507-abcd1234-clip.mp4"
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_without_initialization() {
        let store = store();
        store.close().await;
        store.close().await;
    }

    #[tokio::test]
    async fn upload_after_close_is_unavailable() {
        let store = store();
        store.close().await;

        let result = store
            .upload(ByteStream::from(b"video".to_vec()), "clip.mp4", "video/mp4")
            .await;
        assert_matches!(result, Err(StorageError::Unavailable(_)));

        let file = tempfile::NamedTempFile::new().unwrap();
        let result = store.upload_file(file.path(), "clip.mp4", "video/mp4").await;
        assert_matches!(result, Err(StorageError::Unavailable(_)));
    }
}

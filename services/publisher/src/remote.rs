//! Remote object-storage/sharing port and the three pipeline adapters built on it.
//!
//! The backend exposes exactly three operations: create an object, grant public
//! read on it, and fetch a shareable reference for it. Each adapter wraps one of
//! them with a per-call timeout and maps failures to [`PublishError::RemotePublish`].

use crate::error::{PublishError, RemoteCause};
use crate::intake::NormalizedAsset;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument};
use url::Url;

/// Streamed object payload
pub type ObjectBody = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Opaque identifier of an object created on the remote backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteObjectHandle {
    pub object_id: String,
}

impl RemoteObjectHandle {
    pub fn new(object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
        }
    }
}

impl fmt::Display for RemoteObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.object_id)
    }
}

/// Stable, externally dereferenceable URL of a published object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicReference {
    pub url: String,
}

/// Object creation request: metadata plus payload
pub struct NewObject {
    pub name: String,
    pub content_type: String,
    pub content_length: u64,
    pub body: ObjectBody,
}

impl fmt::Debug for NewObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewObject")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Metadata field selector for reference lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceField {
    /// Link a browser can open to view the object
    WebViewLink,
}

/// Object-storage/sharing backend
///
/// `grant_public_read` must succeed when the object is already public.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Create an object from metadata and a payload stream
    async fn create_object(&self, object: NewObject) -> Result<RemoteObjectHandle, RemoteCause>;

    /// Make the object readable by anyone holding its identifier
    async fn grant_public_read(&self, handle: &RemoteObjectHandle) -> Result<(), RemoteCause>;

    /// Fetch the requested reference field for the object
    async fn fetch_reference(
        &self,
        handle: &RemoteObjectHandle,
        field: ReferenceField,
    ) -> Result<String, RemoteCause>;

    /// Check that the backend is reachable
    async fn health_check(&self) -> Result<(), RemoteCause>;
}

/// Run a remote call under a deadline, mapping elapsed deadlines to [`RemoteCause::Timeout`]
async fn with_deadline<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, PublishError>
where
    F: Future<Output = Result<T, RemoteCause>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(cause)) => Err(PublishError::remote(operation, cause)),
        Err(_) => Err(PublishError::remote(operation, RemoteCause::Timeout(limit))),
    }
}

/// Uploads a normalized asset and returns its handle
#[derive(Clone)]
pub struct RemotePublisher {
    backend: Arc<dyn RemoteBackend>,
    call_timeout: Duration,
}

impl RemotePublisher {
    pub fn new(backend: Arc<dyn RemoteBackend>, call_timeout: Duration) -> Self {
        Self {
            backend,
            call_timeout,
        }
    }

    #[instrument(skip(self, asset), fields(display_name = %asset.display_name, mime_type = %asset.mime_type))]
    pub async fn publish(&self, asset: &NormalizedAsset) -> Result<RemoteObjectHandle, PublishError> {
        let file = tokio::fs::File::open(&asset.storage_location)
            .await
            .map_err(|e| PublishError::local_io("open", &asset.storage_location, e))?;
        let content_length = file
            .metadata()
            .await
            .map_err(|e| PublishError::local_io("stat", &asset.storage_location, e))?
            .len();

        let object = NewObject {
            name: asset.display_name.clone(),
            content_type: asset.mime_type.clone(),
            content_length,
            body: Box::pin(ReaderStream::new(file)),
        };

        let handle = with_deadline(
            "upload",
            self.call_timeout,
            self.backend.create_object(object),
        )
        .await?;

        info!(object_id = %handle, size_bytes = content_length, "Object uploaded");
        Ok(handle)
    }
}

/// Grants public read access on uploaded objects
#[derive(Clone)]
pub struct VisibilityManager {
    backend: Arc<dyn RemoteBackend>,
    call_timeout: Duration,
}

impl VisibilityManager {
    pub fn new(backend: Arc<dyn RemoteBackend>, call_timeout: Duration) -> Self {
        Self {
            backend,
            call_timeout,
        }
    }

    #[instrument(skip(self), fields(object_id = %handle))]
    pub async fn grant_public_read(&self, handle: &RemoteObjectHandle) -> Result<(), PublishError> {
        with_deadline(
            "grant visibility",
            self.call_timeout,
            self.backend.grant_public_read(handle),
        )
        .await?;

        debug!("Public read granted");
        Ok(())
    }
}

/// Resolves the shareable URL of a visible object
#[derive(Clone)]
pub struct ReferenceResolver {
    backend: Arc<dyn RemoteBackend>,
    call_timeout: Duration,
}

impl ReferenceResolver {
    pub fn new(backend: Arc<dyn RemoteBackend>, call_timeout: Duration) -> Self {
        Self {
            backend,
            call_timeout,
        }
    }

    #[instrument(skip(self), fields(object_id = %handle))]
    pub async fn resolve(&self, handle: &RemoteObjectHandle) -> Result<PublicReference, PublishError> {
        let raw = with_deadline(
            "resolve reference",
            self.call_timeout,
            self.backend
                .fetch_reference(handle, ReferenceField::WebViewLink),
        )
        .await?;

        let url = parse_reference(&raw)
            .map_err(|cause| PublishError::remote("resolve reference", cause))?;

        debug!(url = %url, "Reference resolved");
        Ok(PublicReference { url })
    }
}

/// Accept only absolute http(s) URLs with a host
fn parse_reference(raw: &str) -> Result<String, RemoteCause> {
    let parsed = Url::parse(raw.trim())
        .map_err(|e| RemoteCause::InvalidReference(format!("{raw:?}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" if parsed.has_host() => Ok(raw.trim().to_string()),
        _ => Err(RemoteCause::InvalidReference(format!(
            "{raw:?} is not an absolute http(s) URL"
        ))),
    }
}

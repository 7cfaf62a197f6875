//! Ingest-and-publish pipeline.
//!
//! One run takes an [`IntakeRecord`] through
//! `Received → Renamed → Uploaded → VisibilityGranted → Resolved → CleanedUp`.
//! Every transition consumes the previous stage's output, so the remote handle
//! created by the upload is the one that is made visible and resolved.
//! The first failing step ends the run with a [`PipelineFailure`] naming the
//! stage it was trying to reach. Completed remote side effects are not undone.

use crate::error::PublishError;
use crate::intake::{self, IntakeRecord, NormalizedAsset};
use crate::remote::{
    PublicReference, ReferenceResolver, RemoteBackend, RemoteObjectHandle, RemotePublisher,
    VisibilityManager,
};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

/// Pipeline states, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineStage {
    Received,
    Renamed,
    Uploaded,
    VisibilityGranted,
    Resolved,
    CleanedUp,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Received => "Received",
            PipelineStage::Renamed => "Renamed",
            PipelineStage::Uploaded => "Uploaded",
            PipelineStage::VisibilityGranted => "VisibilityGranted",
            PipelineStage::Resolved => "Resolved",
            PipelineStage::CleanedUp => "CleanedUp",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a run
#[derive(Error, Debug)]
#[error("pipeline failed at {stage}: {cause}")]
pub struct PipelineFailure {
    /// Stage the run was trying to reach
    pub stage: PipelineStage,
    #[source]
    pub cause: PublishError,
    /// Remote object left behind by the run, if one was created
    pub orphaned_object: Option<RemoteObjectHandle>,
}

impl PipelineFailure {
    pub fn new(stage: PipelineStage, cause: PublishError) -> Self {
        Self {
            stage,
            cause,
            orphaned_object: None,
        }
    }

    fn with_orphan(mut self, handle: &RemoteObjectHandle) -> Self {
        self.orphaned_object = Some(handle.clone());
        self
    }
}

/// Successful run result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub reference: PublicReference,
    pub object_id: String,
    pub display_name: String,
    /// Whether the local copy was removed; removal failures do not fail the run
    pub cleaned_up: bool,
}

/// Execution limits for the orchestrator
#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    /// Upper bound for each remote call
    pub call_timeout: Duration,
    /// Maximum number of runs executing at once
    pub max_concurrent_runs: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_concurrent_runs: 16,
        }
    }
}

struct Renamed {
    asset: NormalizedAsset,
}

struct Uploaded {
    asset: NormalizedAsset,
    handle: RemoteObjectHandle,
}

struct Visible {
    asset: NormalizedAsset,
    handle: RemoteObjectHandle,
}

struct Resolved {
    asset: NormalizedAsset,
    handle: RemoteObjectHandle,
    reference: PublicReference,
}

/// Sequences one ingest-and-publish run per intake record
#[derive(Clone)]
pub struct Orchestrator {
    publisher: RemotePublisher,
    visibility: VisibilityManager,
    resolver: ReferenceResolver,
    run_slots: Arc<Semaphore>,
    max_concurrent_runs: usize,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn RemoteBackend>, options: PipelineOptions) -> Self {
        let max_concurrent_runs = options.max_concurrent_runs.max(1);
        Self {
            publisher: RemotePublisher::new(backend.clone(), options.call_timeout),
            visibility: VisibilityManager::new(backend.clone(), options.call_timeout),
            resolver: ReferenceResolver::new(backend, options.call_timeout),
            run_slots: Arc::new(Semaphore::new(max_concurrent_runs)),
            max_concurrent_runs,
        }
    }

    /// Run the full pipeline for one intake record
    #[instrument(skip(self, record), fields(opaque_name = %record.opaque_name, original_name = %record.original_name))]
    pub async fn ingest(&self, record: IntakeRecord) -> Result<PublishOutcome, PipelineFailure> {
        // The semaphore is never closed; a failed acquire only means no limit applies.
        let _permit = self.run_slots.acquire().await.ok();
        let started = Instant::now();

        let result = self.run(&record).await;

        metrics::histogram!("publisher.run.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(outcome) => {
                metrics::counter!("publisher.runs.succeeded").increment(1);
                info!(
                    object_id = %outcome.object_id,
                    url = %outcome.reference.url,
                    cleaned_up = outcome.cleaned_up,
                    "File published"
                );
            }
            Err(failure) => {
                metrics::counter!("publisher.runs.failed", "stage" => failure.stage.as_str())
                    .increment(1);
                match &failure.orphaned_object {
                    Some(handle) => warn!(
                        stage = %failure.stage,
                        object_id = %handle,
                        error = %failure.cause,
                        "Publishing failed after upload; remote object left for reconciliation"
                    ),
                    None => error!(
                        stage = %failure.stage,
                        error = %failure.cause,
                        "Publishing failed"
                    ),
                }
            }
        }

        result
    }

    /// Run independent pipelines concurrently, returning results in input order
    ///
    /// Library entry point for callers publishing several intake records at
    /// once, such as a job re-driving files left in the intake directory. The
    /// HTTP API publishes one file per request through [`Orchestrator::ingest`].
    pub async fn ingest_batch(
        &self,
        records: Vec<IntakeRecord>,
    ) -> Vec<Result<PublishOutcome, PipelineFailure>> {
        stream::iter(records)
            .map(|record| self.ingest(record))
            .buffered(self.max_concurrent_runs)
            .collect()
            .await
    }

    async fn run(&self, record: &IntakeRecord) -> Result<PublishOutcome, PipelineFailure> {
        let renamed = self.rename(record).await?;
        let uploaded = self.upload(renamed).await?;
        let visible = self.grant(uploaded).await?;
        let resolved = self.resolve(visible).await?;
        Ok(self.clean_up(resolved).await)
    }

    async fn rename(&self, record: &IntakeRecord) -> Result<Renamed, PipelineFailure> {
        let asset = intake::normalize(record)
            .await
            .map_err(|e| PipelineFailure::new(PipelineStage::Renamed, e))?;
        Ok(Renamed { asset })
    }

    async fn upload(&self, renamed: Renamed) -> Result<Uploaded, PipelineFailure> {
        let handle = self
            .publisher
            .publish(&renamed.asset)
            .await
            .map_err(|e| PipelineFailure::new(PipelineStage::Uploaded, e))?;
        Ok(Uploaded {
            asset: renamed.asset,
            handle,
        })
    }

    async fn grant(&self, uploaded: Uploaded) -> Result<Visible, PipelineFailure> {
        self.visibility
            .grant_public_read(&uploaded.handle)
            .await
            .map_err(|e| {
                PipelineFailure::new(PipelineStage::VisibilityGranted, e)
                    .with_orphan(&uploaded.handle)
            })?;
        Ok(Visible {
            asset: uploaded.asset,
            handle: uploaded.handle,
        })
    }

    async fn resolve(&self, visible: Visible) -> Result<Resolved, PipelineFailure> {
        let reference = self.resolver.resolve(&visible.handle).await.map_err(|e| {
            PipelineFailure::new(PipelineStage::Resolved, e).with_orphan(&visible.handle)
        })?;
        Ok(Resolved {
            asset: visible.asset,
            handle: visible.handle,
            reference,
        })
    }

    async fn clean_up(&self, resolved: Resolved) -> PublishOutcome {
        let cleaned_up = match intake::cleanup(&resolved.asset).await {
            Ok(()) => true,
            Err(e) => {
                metrics::counter!("publisher.cleanup.failed").increment(1);
                warn!(error = %e, "Failed to remove local copy after publishing");
                false
            }
        };

        PublishOutcome {
            reference: resolved.reference,
            object_id: resolved.handle.object_id,
            display_name: resolved.asset.display_name,
            cleaned_up,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteCause;
    use crate::memory_backend::InMemoryBackend;
    use crate::remote::{MockRemoteBackend, ReferenceField};
    use std::path::Path;
    use tempfile::TempDir;

    fn intake_file(dir: &Path, opaque: &str, original: &str) -> IntakeRecord {
        let storage_location = dir.join(opaque);
        std::fs::write(&storage_location, b"\x89PNG fake image").unwrap();
        IntakeRecord {
            opaque_name: opaque.to_string(),
            original_name: original.to_string(),
            storage_location,
            declared_mime_type: "image/png".to_string(),
        }
    }

    fn orchestrator(backend: impl RemoteBackend + 'static) -> Orchestrator {
        Orchestrator::new(Arc::new(backend), PipelineOptions::default())
    }

    /// Backend that answers OBJ123 / https://store.example/view/OBJ123
    fn happy_backend() -> MockRemoteBackend {
        let mut backend = MockRemoteBackend::new();
        backend
            .expect_create_object()
            .times(1)
            .returning(|_| Ok(RemoteObjectHandle::new("OBJ123")));
        backend
            .expect_grant_public_read()
            .withf(|handle| handle.object_id == "OBJ123")
            .times(1)
            .returning(|_| Ok(()));
        backend
            .expect_fetch_reference()
            .withf(|handle, field| {
                handle.object_id == "OBJ123" && *field == ReferenceField::WebViewLink
            })
            .times(1)
            .returning(|handle, _| Ok(format!("https://store.example/view/{}", handle.object_id)));
        backend
    }

    #[tokio::test]
    async fn test_end_to_end_success() {
        let dir = TempDir::new().unwrap();
        let record = intake_file(dir.path(), "a1b2c3", "couch.png");

        let outcome = orchestrator(happy_backend()).ingest(record).await.unwrap();

        assert_eq!(outcome.reference.url, "https://store.example/view/OBJ123");
        assert_eq!(outcome.object_id, "OBJ123");
        assert_eq!(outcome.display_name, "couch");
        assert!(outcome.cleaned_up);
        assert!(!dir.path().join("couch.png").exists());
        assert!(!dir.path().join("a1b2c3").exists());
        assert!(url::Url::parse(&outcome.reference.url).is_ok());
    }

    #[tokio::test]
    async fn test_visibility_failure_keeps_local_copy() {
        let dir = TempDir::new().unwrap();
        let record = intake_file(dir.path(), "a1b2c3", "couch.png");

        let mut backend = MockRemoteBackend::new();
        backend
            .expect_create_object()
            .times(1)
            .returning(|_| Ok(RemoteObjectHandle::new("OBJ123")));
        backend
            .expect_grant_public_read()
            .times(1)
            .returning(|_| Err(RemoteCause::backend("401 unauthorized")));
        backend.expect_fetch_reference().times(0);

        let failure = orchestrator(backend).ingest(record).await.unwrap_err();

        assert_eq!(failure.stage, PipelineStage::VisibilityGranted);
        assert!(matches!(failure.cause, PublishError::RemotePublish { .. }));
        assert!(failure.cause.to_string().contains("401 unauthorized"));
        assert_eq!(failure.orphaned_object, Some(RemoteObjectHandle::new("OBJ123")));
        assert!(dir.path().join("couch.png").exists());
    }

    #[tokio::test]
    async fn test_upload_failure_short_circuits() {
        let dir = TempDir::new().unwrap();
        let record = intake_file(dir.path(), "a1b2c3", "couch.png");

        let mut backend = MockRemoteBackend::new();
        backend
            .expect_create_object()
            .times(1)
            .returning(|_| Err(RemoteCause::backend("connection reset")));
        backend.expect_grant_public_read().times(0);
        backend.expect_fetch_reference().times(0);

        let failure = orchestrator(backend).ingest(record).await.unwrap_err();

        assert_eq!(failure.stage, PipelineStage::Uploaded);
        assert!(failure.orphaned_object.is_none());
        assert!(dir.path().join("couch.png").exists());
    }

    #[tokio::test]
    async fn test_resolve_failure_keeps_local_copy() {
        let dir = TempDir::new().unwrap();
        let record = intake_file(dir.path(), "a1b2c3", "couch.png");

        let mut backend = MockRemoteBackend::new();
        backend
            .expect_create_object()
            .returning(|_| Ok(RemoteObjectHandle::new("OBJ123")));
        backend.expect_grant_public_read().returning(|_| Ok(()));
        backend
            .expect_fetch_reference()
            .returning(|_, _| Err(RemoteCause::backend("field not available")));

        let failure = orchestrator(backend).ingest(record).await.unwrap_err();

        assert_eq!(failure.stage, PipelineStage::Resolved);
        assert!(dir.path().join("couch.png").exists());
    }

    #[tokio::test]
    async fn test_malformed_name_never_reaches_backend() {
        let dir = TempDir::new().unwrap();
        let record = intake_file(dir.path(), "a1b2c3", "../../couch.png");

        let mut backend = MockRemoteBackend::new();
        backend.expect_create_object().times(0);
        backend.expect_grant_public_read().times(0);
        backend.expect_fetch_reference().times(0);

        let failure = orchestrator(backend).ingest(record).await.unwrap_err();

        assert_eq!(failure.stage, PipelineStage::Renamed);
        assert!(matches!(failure.cause, PublishError::MalformedInput(_)));
        assert!(dir.path().join("a1b2c3").exists());
    }

    #[tokio::test]
    async fn test_rename_failure_aborts_before_upload() {
        let dir = TempDir::new().unwrap();
        let record = IntakeRecord {
            opaque_name: "missing".to_string(),
            original_name: "couch.png".to_string(),
            storage_location: dir.path().join("missing"),
            declared_mime_type: "image/png".to_string(),
        };

        let mut backend = MockRemoteBackend::new();
        backend.expect_create_object().times(0);

        let failure = orchestrator(backend).ingest(record).await.unwrap_err();

        assert_eq!(failure.stage, PipelineStage::Renamed);
        assert!(matches!(failure.cause, PublishError::LocalIo { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_failure_does_not_fail_run() {
        let dir = TempDir::new().unwrap();
        let record = intake_file(dir.path(), "a1b2c3", "couch.png");
        let renamed = dir.path().join("couch.png");

        let mut backend = MockRemoteBackend::new();
        backend.expect_create_object().returning(move |_| {
            // Something else removes the local file while the upload is in flight.
            std::fs::remove_file(&renamed).unwrap();
            Ok(RemoteObjectHandle::new("OBJ123"))
        });
        backend.expect_grant_public_read().returning(|_| Ok(()));
        backend
            .expect_fetch_reference()
            .returning(|_, _| Ok("https://store.example/view/OBJ123".to_string()));

        let outcome = orchestrator(backend).ingest(record).await.unwrap();

        assert_eq!(outcome.reference.url, "https://store.example/view/OBJ123");
        assert!(!outcome.cleaned_up);
    }

    #[tokio::test]
    async fn test_in_memory_backend_round_trip() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(InMemoryBackend::new("https://store.example/view"));
        let orchestrator = Orchestrator::new(backend.clone(), PipelineOptions::default());

        let record = intake_file(dir.path(), "a1b2c3", "couch.png");
        let outcome = orchestrator.ingest(record).await.unwrap();

        let stored = backend.object(&outcome.object_id).unwrap();
        assert!(stored.public);
        assert_eq!(stored.name, "couch");
        assert_eq!(stored.content_type, "image/png");
        assert_eq!(stored.data.as_ref(), b"\x89PNG fake image");
        assert_eq!(
            outcome.reference.url,
            format!("https://store.example/view/{}", outcome.object_id)
        );
    }

    #[tokio::test]
    async fn test_batch_runs_are_independent() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(InMemoryBackend::new("https://store.example/view"));
        let orchestrator = Orchestrator::new(
            backend.clone(),
            PipelineOptions {
                call_timeout: Duration::from_secs(5),
                max_concurrent_runs: 2,
            },
        );

        let records = vec![
            intake_file(dir.path(), "0001", "couch.png"),
            intake_file(dir.path(), "0002", "no-extension"),
            intake_file(dir.path(), "0003", "stool.jpg"),
        ];

        let results = orchestrator.ingest_batch(records).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().display_name, "couch");
        assert_eq!(
            results[1].as_ref().unwrap_err().stage,
            PipelineStage::Renamed
        );
        assert_eq!(results[2].as_ref().unwrap().display_name, "stool");
        assert_eq!(backend.object_count(), 2);
        assert!(dir.path().join("0002").exists());
        assert!(!dir.path().join("couch.png").exists());
        assert!(!dir.path().join("stool.jpg").exists());
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(PipelineStage::VisibilityGranted.to_string(), "VisibilityGranted");
        assert_eq!(
            serde_json::to_string(&PipelineStage::Uploaded).unwrap(),
            "\"Uploaded\""
        );
    }
}

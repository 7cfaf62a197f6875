//! Local intake handling: receiving bytes under an opaque name, normalizing
//! the client-supplied filename, and removing the local copy afterwards.

use crate::error::PublishError;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const MAX_NAME_BYTES: usize = 255;
const OCTET_STREAM: &str = "application/octet-stream";

/// An uploaded file waiting in the intake directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeRecord {
    /// Server-generated name the bytes were written under
    pub opaque_name: String,
    /// Filename supplied by the client
    pub original_name: String,
    /// Full path of the opaque file
    pub storage_location: PathBuf,
    /// Content type declared by the client
    pub declared_mime_type: String,
}

impl IntakeRecord {
    /// Directory the record lives in
    pub fn directory(&self) -> &Path {
        self.storage_location.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// The intake file after it was renamed to its original filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedAsset {
    /// Original filename without its final extension
    pub display_name: String,
    /// Path of the renamed file
    pub storage_location: PathBuf,
    /// Content type to publish with
    pub mime_type: String,
}

/// Directory-backed store that writes incoming uploads under opaque names
#[derive(Debug, Clone)]
pub struct IntakeStore {
    directory: PathBuf,
}

impl IntakeStore {
    /// Create the store, making sure the directory exists
    pub async fn new(directory: impl Into<PathBuf>) -> Result<Self, PublishError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)
            .await
            .map_err(|e| PublishError::local_io("create intake directory", &directory, e))?;

        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Write a byte stream to a fresh opaque file and describe it
    ///
    /// A partially written file is removed when the stream or the write fails.
    #[instrument(skip(self, body), fields(original_name = %original_name))]
    pub async fn receive<S, E>(
        &self,
        original_name: &str,
        declared_mime_type: &str,
        body: S,
    ) -> Result<IntakeRecord, ReceiveError<E>>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let opaque_name = Uuid::new_v4().simple().to_string();
        let storage_location = self.directory.join(&opaque_name);

        if let Err(e) = write_stream(&storage_location, body).await {
            if let Err(remove_err) = fs::remove_file(&storage_location).await {
                if remove_err.kind() != io::ErrorKind::NotFound {
                    warn!(
                        path = %storage_location.display(),
                        error = %remove_err,
                        "Failed to remove partial intake file"
                    );
                }
            }
            return Err(e);
        }

        debug!(opaque_name = %opaque_name, "Intake file written");

        Ok(IntakeRecord {
            opaque_name,
            original_name: original_name.to_string(),
            storage_location,
            declared_mime_type: declared_mime_type.to_string(),
        })
    }
}

/// Why an upload body never became an intake file
#[derive(Error, Debug)]
pub enum ReceiveError<E> {
    /// The incoming stream failed, e.g. the client disconnected or the body
    /// exceeded its size limit
    #[error("upload body could not be read: {0}")]
    Body(#[source] E),

    #[error(transparent)]
    Local(#[from] PublishError),
}

async fn write_stream<S, E>(path: &Path, body: S) -> Result<u64, ReceiveError<E>>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    let local = |e: io::Error| ReceiveError::Local(PublishError::local_io("intake write", path, e));

    let mut file = fs::File::create(path).await.map_err(local)?;
    let mut body = std::pin::pin!(body);
    let mut written = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(ReceiveError::Body)?;
        file.write_all(&chunk).await.map_err(local)?;
        written += chunk.len() as u64;
    }

    file.flush().await.map_err(local)?;
    file.sync_all().await.map_err(local)?;
    Ok(written)
}

/// Reject client filenames that are unsafe to use as a local path or lack an extension
pub fn validate_original_name(name: &str) -> Result<(), PublishError> {
    if name.is_empty() {
        return Err(PublishError::malformed("filename is empty"));
    }
    if name.len() > MAX_NAME_BYTES {
        return Err(PublishError::malformed(format!(
            "filename exceeds {MAX_NAME_BYTES} bytes"
        )));
    }
    if name == "." || name == ".." {
        return Err(PublishError::malformed("filename is a relative path segment"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(PublishError::malformed("filename contains a path separator"));
    }
    if name.chars().any(char::is_control) {
        return Err(PublishError::malformed("filename contains control characters"));
    }
    if name.starts_with('.') {
        return Err(PublishError::malformed("filename has no name before its extension"));
    }

    match name.rfind('.') {
        None => Err(PublishError::malformed("filename has no extension")),
        Some(idx) if idx + 1 == name.len() => {
            Err(PublishError::malformed("filename has an empty extension"))
        }
        Some(_) => Ok(()),
    }
}

/// Original filename with everything from the last `.` removed
///
/// Names without a `.` are returned unchanged.
pub fn display_name(original_name: &str) -> &str {
    match original_name.rfind('.') {
        Some(idx) => &original_name[..idx],
        None => original_name,
    }
}

/// Extension after the last `.`, if any
pub fn extension(original_name: &str) -> Option<&str> {
    original_name
        .rfind('.')
        .map(|idx| &original_name[idx + 1..])
        .filter(|ext| !ext.is_empty())
}

/// Content type implied by a file extension
pub fn content_type_for_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "glb" => "model/gltf-binary",
        "gltf" => "model/gltf+json",
        "usdz" => "model/vnd.usdz+zip",
        "mp4" => "video/mp4",
        "pdf" => "application/pdf",
        _ => OCTET_STREAM,
    }
}

/// Declared type, falling back to the extension when the client sent nothing useful
fn effective_mime_type(record: &IntakeRecord) -> String {
    let declared = record.declared_mime_type.trim();
    if declared.is_empty() || declared.eq_ignore_ascii_case(OCTET_STREAM) {
        extension(&record.original_name)
            .map(content_type_for_extension)
            .unwrap_or(OCTET_STREAM)
            .to_string()
    } else {
        declared.to_string()
    }
}

/// Validate the client filename and rename the intake file to it
///
/// Refuses to overwrite an existing file with the same name. The new name is
/// claimed with a hard link, which the filesystem creates only if the name is
/// free, and the opaque name is dropped afterwards.
#[instrument(skip(record), fields(opaque_name = %record.opaque_name, original_name = %record.original_name))]
pub async fn normalize(record: &IntakeRecord) -> Result<NormalizedAsset, PublishError> {
    validate_original_name(&record.original_name)?;

    let target = record.directory().join(&record.original_name);

    fs::hard_link(&record.storage_location, &target)
        .await
        .map_err(|e| {
            let path = if e.kind() == io::ErrorKind::AlreadyExists {
                &target
            } else {
                &record.storage_location
            };
            PublishError::local_io("rename", path, e)
        })?;

    if let Err(e) = fs::remove_file(&record.storage_location).await {
        // Release the claimed name; the opaque file is still the only copy
        if let Err(unlink_err) = fs::remove_file(&target).await {
            warn!(
                path = %target.display(),
                error = %unlink_err,
                "Failed to release claimed name"
            );
        }
        return Err(PublishError::local_io("rename", &record.storage_location, e));
    }

    debug!(path = %target.display(), "Intake file renamed");

    Ok(NormalizedAsset {
        display_name: display_name(&record.original_name).to_string(),
        storage_location: target,
        mime_type: effective_mime_type(record),
    })
}

/// Delete the local copy of a published asset
#[instrument(skip(asset), fields(path = %asset.storage_location.display()))]
pub async fn cleanup(asset: &NormalizedAsset) -> Result<(), PublishError> {
    fs::remove_file(&asset.storage_location)
        .await
        .map_err(|e| PublishError::local_io("delete", &asset.storage_location, e))?;

    debug!("Local copy removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    async fn write_intake(dir: &TempDir, opaque: &str, original: &str) -> IntakeRecord {
        let storage_location = dir.path().join(opaque);
        fs::write(&storage_location, b"payload").await.unwrap();
        IntakeRecord {
            opaque_name: opaque.to_string(),
            original_name: original.to_string(),
            storage_location,
            declared_mime_type: "image/png".to_string(),
        }
    }

    #[test]
    fn test_display_name_strips_final_extension() {
        assert_eq!(display_name("photo.JPG"), "photo");
        assert_eq!(display_name("couch.png"), "couch");
        assert_eq!(display_name("archive.tar.gz"), "archive.tar");
        assert_eq!(display_name("noext"), "noext");
    }

    #[test]
    fn test_validate_accepts_ordinary_names() {
        assert_ok!(validate_original_name("couch.png"));
        assert_ok!(validate_original_name("living room sofa.v2.jpeg"));
        assert_ok!(validate_original_name("chaise-longue_01.glb"));
    }

    #[test]
    fn test_validate_rejects_unsafe_names() {
        for name in [
            "",
            ".",
            "..",
            "../etc/passwd.png",
            "dir/file.png",
            "dir\\file.png",
            ".hidden",
            "bad\u{0}name.png",
            "line\nbreak.png",
            "noextension",
            "trailingdot.",
        ] {
            let err = validate_original_name(name).unwrap_err();
            assert!(
                matches!(err, PublishError::MalformedInput(_)),
                "expected MalformedInput for {name:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_validate_rejects_overlong_names() {
        let name = format!("{}.png", "a".repeat(MAX_NAME_BYTES));
        assert_err!(validate_original_name(&name));
    }

    #[test]
    fn test_content_type_for_extension() {
        assert_eq!(content_type_for_extension("JPG"), "image/jpeg");
        assert_eq!(content_type_for_extension("png"), "image/png");
        assert_eq!(content_type_for_extension("glb"), "model/gltf-binary");
        assert_eq!(content_type_for_extension("xyz"), OCTET_STREAM);
    }

    #[tokio::test]
    async fn test_normalize_renames_to_original_name() {
        let dir = TempDir::new().unwrap();
        let record = write_intake(&dir, "a1b2c3", "couch.png").await;

        let asset = normalize(&record).await.unwrap();

        assert_eq!(asset.display_name, "couch");
        assert_eq!(asset.storage_location, dir.path().join("couch.png"));
        assert_eq!(asset.mime_type, "image/png");
        assert!(!record.storage_location.exists());
        assert!(asset.storage_location.exists());
    }

    #[tokio::test]
    async fn test_normalize_infers_mime_type_when_not_declared() {
        let dir = TempDir::new().unwrap();
        let mut record = write_intake(&dir, "f00d", "chair.glb").await;
        record.declared_mime_type = String::new();

        let asset = normalize(&record).await.unwrap();
        assert_eq!(asset.mime_type, "model/gltf-binary");
    }

    #[tokio::test]
    async fn test_normalize_rejects_traversal_before_touching_disk() {
        let dir = TempDir::new().unwrap();
        let record = write_intake(&dir, "beef", "../escape.png").await;

        let err = normalize(&record).await.unwrap_err();
        assert!(matches!(err, PublishError::MalformedInput(_)));
        assert!(record.storage_location.exists());
    }

    #[tokio::test]
    async fn test_normalize_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("couch.png"), b"other run").await.unwrap();
        let record = write_intake(&dir, "cafe", "couch.png").await;

        let err = normalize(&record).await.unwrap_err();
        assert!(matches!(err, PublishError::LocalIo { operation: "rename", .. }));
        assert!(record.storage_location.exists());
        assert_eq!(
            fs::read(dir.path().join("couch.png")).await.unwrap(),
            b"other run"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_normalize_same_name_has_one_winner() {
        let dir = TempDir::new().unwrap();
        let mut records = Vec::new();
        for i in 0..32 {
            let opaque_name = format!("opaque{i:02}");
            let storage_location = dir.path().join(&opaque_name);
            fs::write(&storage_location, &opaque_name).await.unwrap();
            records.push(IntakeRecord {
                opaque_name,
                original_name: "couch.png".to_string(),
                storage_location,
                declared_mime_type: "image/png".to_string(),
            });
        }

        let handles: Vec<_> = records
            .into_iter()
            .map(|record| {
                tokio::spawn(async move {
                    let result = normalize(&record).await;
                    (record, result)
                })
            })
            .collect();

        let mut winners = Vec::new();
        for handle in handles {
            let (record, result) = handle.await.unwrap();
            match result {
                Ok(_) => {
                    assert!(!record.storage_location.exists());
                    winners.push(record);
                }
                Err(e) => {
                    assert!(matches!(e, PublishError::LocalIo { operation: "rename", .. }));
                    assert!(record.storage_location.exists());
                }
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(
            fs::read_to_string(dir.path().join("couch.png")).await.unwrap(),
            winners[0].opaque_name
        );
    }

    #[tokio::test]
    async fn test_normalize_missing_source_is_local_io() {
        let dir = TempDir::new().unwrap();
        let record = IntakeRecord {
            opaque_name: "gone".to_string(),
            original_name: "couch.png".to_string(),
            storage_location: dir.path().join("gone"),
            declared_mime_type: "image/png".to_string(),
        };

        let err = normalize(&record).await.unwrap_err();
        assert!(matches!(err, PublishError::LocalIo { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_removes_file_and_reports_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("couch.png");
        fs::write(&path, b"payload").await.unwrap();
        let asset = NormalizedAsset {
            display_name: "couch".to_string(),
            storage_location: path.clone(),
            mime_type: "image/png".to_string(),
        };

        assert_ok!(cleanup(&asset).await);
        assert!(!path.exists());
        assert_err!(cleanup(&asset).await);
    }

    #[tokio::test]
    async fn test_receive_writes_opaque_file() {
        let dir = TempDir::new().unwrap();
        let store = IntakeStore::new(dir.path()).await.unwrap();
        let body = stream::iter(vec![
            Ok::<_, io::Error>(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]);

        let record = store.receive("couch.png", "image/png", body).await.unwrap();

        assert_eq!(record.original_name, "couch.png");
        assert_ne!(record.opaque_name, "couch.png");
        assert_eq!(record.directory(), dir.path());
        assert_eq!(fs::read(&record.storage_location).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_receive_removes_partial_file_on_stream_error() {
        let dir = TempDir::new().unwrap();
        let store = IntakeStore::new(dir.path()).await.unwrap();
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ]);

        let err = store.receive("couch.png", "image/png", body).await.unwrap_err();

        match err {
            ReceiveError::Body(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("expected a body error, got {other:?}"),
        }
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_receive_reports_disk_failure_as_local_io() {
        let dir = TempDir::new().unwrap();
        let store = IntakeStore::new(dir.path().join("intake")).await.unwrap();
        fs::remove_dir(store.directory()).await.unwrap();
        let body = stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(b"bytes"))]);

        let err = store.receive("couch.png", "image/png", body).await.unwrap_err();

        assert!(matches!(
            err,
            ReceiveError::Local(PublishError::LocalIo { operation: "intake write", .. })
        ));
    }
}

use crate::config::S3Config;
use crate::error::RemoteCause;
use crate::remote::{NewObject, ObjectBody, ReferenceField, RemoteBackend, RemoteObjectHandle};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ObjectCannedAcl};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use bytes::BytesMut;
use futures::StreamExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// How a payload of a given size is sent to S3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadPlan {
    /// One `put_object` with the whole body in memory
    Single,
    /// Multipart upload holding at most one part in memory
    Multipart { part_size: usize },
}

fn upload_plan(config: &S3Config, content_length: u64) -> UploadPlan {
    if content_length > config.multipart_threshold_bytes as u64 {
        UploadPlan::Multipart {
            part_size: config.part_size_bytes,
        }
    } else {
        UploadPlan::Single
    }
}

/// What granting public read does against the bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrantAction {
    ApplyPublicReadAcl,
    /// Bucket policy decides visibility; only confirm the object exists
    VerifyExists,
}

fn grant_action(config: &S3Config) -> GrantAction {
    if config.grant_acl {
        GrantAction::ApplyPublicReadAcl
    } else {
        GrantAction::VerifyExists
    }
}

/// Pull chunks into `buffer` until it holds at least `limit` bytes or the body ends.
/// Returns `true` once the body is exhausted.
async fn fill_part(
    body: &mut ObjectBody,
    buffer: &mut BytesMut,
    limit: usize,
) -> Result<bool, RemoteCause> {
    while buffer.len() < limit {
        match body.next().await {
            Some(chunk) => {
                let chunk =
                    chunk.map_err(|e| RemoteCause::backend(format!("read payload: {e}")))?;
                buffer.extend_from_slice(&chunk);
            }
            None => return Ok(true),
        }
    }
    Ok(false)
}

/// S3 (or S3-compatible) object backend
pub struct S3Backend {
    client: S3Client,
    config: S3Config,
}

impl S3Backend {
    /// Create a new S3 backend
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            grant_acl = config.grant_acl,
            "S3 backend initialized"
        );

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Generate an object key for a display name
    /// Format: {prefix}/{uuid}/{sanitized display name}
    pub fn generate_key(&self, display_name: &str) -> String {
        object_key(&self.config.key_prefix, Uuid::new_v4(), display_name)
    }

    /// Public URL of an object key
    pub fn object_url(&self, key: &str) -> String {
        object_url(&self.config, key)
    }

    async fn head(&self, key: &str) -> Result<(), RemoteCause> {
        self.client
            .head_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| RemoteCause::backend(format!("head_object {key}: {}", DisplayErrorContext(&e))))?;
        Ok(())
    }

    async fn single_upload(
        &self,
        key: &str,
        name: &str,
        content_type: &str,
        content_length: u64,
        body: &mut ObjectBody,
    ) -> Result<(), RemoteCause> {
        let mut data = BytesMut::with_capacity(content_length as usize);
        fill_part(body, &mut data, usize::MAX).await?;
        let size = data.len();

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .body(ByteStream::from(data.freeze()))
            .content_type(content_type)
            .content_length(size as i64)
            .metadata("display-name", name)
            .send()
            .await
            .map_err(|e| RemoteCause::backend(format!("put_object {key}: {}", DisplayErrorContext(&e))))?;

        Ok(())
    }

    /// Multipart upload for large files
    ///
    /// The upload is aborted when any part or the completion fails so the
    /// bucket keeps no dangling parts.
    async fn multipart_upload(
        &self,
        key: &str,
        name: &str,
        content_type: &str,
        body: &mut ObjectBody,
        part_size: usize,
    ) -> Result<(), RemoteCause> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .content_type(content_type)
            .metadata("display-name", name)
            .send()
            .await
            .map_err(|e| {
                RemoteCause::backend(format!(
                    "create_multipart_upload {key}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| RemoteCause::backend(format!("no upload id returned for {key}")))?
            .to_string();

        let result = self.send_parts(key, &upload_id, body, part_size).await;

        if result.is_err() {
            if let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.config.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!(
                    s3_key = %key,
                    upload_id = %upload_id,
                    error = %DisplayErrorContext(&e),
                    "Failed to abort multipart upload"
                );
            }
        }

        result
    }

    async fn send_parts(
        &self,
        key: &str,
        upload_id: &str,
        body: &mut ObjectBody,
        part_size: usize,
    ) -> Result<(), RemoteCause> {
        let mut completed_parts = Vec::new();
        let mut buffer = BytesMut::with_capacity(part_size);
        let mut part_number = 1;
        let mut finished = false;

        while !finished {
            finished = fill_part(body, &mut buffer, part_size).await?;
            if buffer.is_empty() && part_number > 1 {
                break;
            }

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.config.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buffer.split().freeze()))
                .send()
                .await
                .map_err(|e| {
                    RemoteCause::backend(format!(
                        "upload_part {part_number} of {key}: {}",
                        DisplayErrorContext(&e)
                    ))
                })?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| {
                RemoteCause::backend(format!(
                    "complete_multipart_upload {key}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for S3Backend {
    #[instrument(skip(self, object), fields(name = %object.name, size_bytes = object.content_length))]
    async fn create_object(&self, object: NewObject) -> Result<RemoteObjectHandle, RemoteCause> {
        let NewObject {
            name,
            content_type,
            content_length,
            mut body,
        } = object;

        let key = self.generate_key(&name);

        match upload_plan(&self.config, content_length) {
            UploadPlan::Single => {
                self.single_upload(&key, &name, &content_type, content_length, &mut body)
                    .await?
            }
            UploadPlan::Multipart { part_size } => {
                self.multipart_upload(&key, &name, &content_type, &mut body, part_size)
                    .await?
            }
        }

        debug!(s3_key = %key, size_bytes = content_length, "Object uploaded to S3");

        Ok(RemoteObjectHandle::new(key))
    }

    #[instrument(skip(self), fields(s3_key = %handle.object_id))]
    async fn grant_public_read(&self, handle: &RemoteObjectHandle) -> Result<(), RemoteCause> {
        if grant_action(&self.config) == GrantAction::VerifyExists {
            return self.head(&handle.object_id).await;
        }

        self.client
            .put_object_acl()
            .bucket(&self.config.bucket)
            .key(&handle.object_id)
            .acl(ObjectCannedAcl::PublicRead)
            .send()
            .await
            .map_err(|e| {
                RemoteCause::backend(format!(
                    "put_object_acl {}: {}",
                    handle.object_id,
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(())
    }

    #[instrument(skip(self), fields(s3_key = %handle.object_id))]
    async fn fetch_reference(
        &self,
        handle: &RemoteObjectHandle,
        field: ReferenceField,
    ) -> Result<String, RemoteCause> {
        self.head(&handle.object_id).await?;

        match field {
            ReferenceField::WebViewLink => Ok(self.object_url(&handle.object_id)),
        }
    }

    async fn health_check(&self) -> Result<(), RemoteCause> {
        self.client
            .head_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
            .map_err(|e| RemoteCause::backend(format!("head_bucket: {}", DisplayErrorContext(&e))))?;
        Ok(())
    }
}

fn object_key(prefix: &str, id: Uuid, display_name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let name = sanitize_path_component(display_name);
    if prefix.is_empty() {
        format!("{id}/{name}")
    } else {
        format!("{prefix}/{id}/{name}")
    }
}

fn object_url(config: &S3Config, key: &str) -> String {
    if let Some(ref base) = config.public_base_url {
        return format!("{}/{}", base.trim_end_matches('/'), key);
    }

    match config.endpoint_url {
        Some(ref endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), config.bucket, key),
        None if config.force_path_style => format!(
            "https://s3.{}.amazonaws.com/{}/{}",
            config.region, config.bucket, key
        ),
        None => format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            config.bucket, config.region, key
        ),
    }
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    let sanitized: String = component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect();

    if sanitized.is_empty() {
        "object".to_string()
    } else {
        sanitized
    }
}

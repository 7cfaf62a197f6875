use crate::error::RemoteCause;
use crate::remote::{NewObject, ReferenceField, RemoteBackend, RemoteObjectHandle};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Object held by the in-memory backend
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub name: String,
    pub content_type: String,
    pub data: Bytes,
    pub public: bool,
}

/// Process-local backend for development and tests
///
/// References are only handed out for objects that were made public.
pub struct InMemoryBackend {
    base_url: String,
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl InMemoryBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn object(&self, object_id: &str) -> Option<StoredObject> {
        self.objects.read().get(object_id).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }
}

#[async_trait]
impl RemoteBackend for InMemoryBackend {
    async fn create_object(&self, object: NewObject) -> Result<RemoteObjectHandle, RemoteCause> {
        let NewObject {
            name,
            content_type,
            content_length,
            mut body,
        } = object;

        let mut data = BytesMut::with_capacity(content_length as usize);
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| RemoteCause::backend(format!("read payload: {e}")))?;
            data.extend_from_slice(&chunk);
        }

        let object_id = Uuid::new_v4().simple().to_string();
        debug!(object_id = %object_id, size_bytes = data.len(), "Stored object in memory");

        self.objects.write().insert(
            object_id.clone(),
            StoredObject {
                name,
                content_type,
                data: data.freeze(),
                public: false,
            },
        );

        Ok(RemoteObjectHandle::new(object_id))
    }

    async fn grant_public_read(&self, handle: &RemoteObjectHandle) -> Result<(), RemoteCause> {
        let mut objects = self.objects.write();
        let object = objects
            .get_mut(&handle.object_id)
            .ok_or_else(|| RemoteCause::backend(format!("object {handle} not found")))?;
        object.public = true;
        Ok(())
    }

    async fn fetch_reference(
        &self,
        handle: &RemoteObjectHandle,
        field: ReferenceField,
    ) -> Result<String, RemoteCause> {
        let objects = self.objects.read();
        let object = objects
            .get(&handle.object_id)
            .ok_or_else(|| RemoteCause::backend(format!("object {handle} not found")))?;

        if !object.public {
            return Err(RemoteCause::backend(format!("object {handle} is not public")));
        }

        Ok(match field {
            ReferenceField::WebViewLink => format!("{}/{}", self.base_url, handle.object_id),
        })
    }

    async fn health_check(&self) -> Result<(), RemoteCause> {
        Ok(())
    }
}

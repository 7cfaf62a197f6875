//! Storefront Publisher Service
//!
//! File ingestion and publishing pipeline for the storefront backend. A file
//! uploaded by the mobile client lands in a local intake directory under an
//! opaque name; the pipeline renames it to its original filename, uploads it
//! to an object-storage/sharing backend, makes it publicly readable, resolves a
//! stable URL for it and removes the local copy.
//!
//! ## Architecture
//!
//! ```text
//!  POST /api/v1/files
//!         │
//!         ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Intake       │──▶│ Naming       │──▶│ Remote       │──▶│ Visibility   │
//! │ Store        │   │ Normalizer   │   │ Publisher    │   │ Manager      │
//! └──────────────┘   └──────────────┘   └──────────────┘   └──────────────┘
//!                                                                  │
//!                     ┌──────────────┐   ┌──────────────┐          │
//!       { fileUrl } ◀─│ Cleanup      │◀──│ Reference    │◀─────────┘
//!                     │ Agent        │   │ Resolver     │
//!                     └──────────────┘   └──────────────┘
//! ```
//!
//! The remote steps go through the [`RemoteBackend`] trait; [`S3Backend`] talks
//! to S3 or any S3-compatible store, [`InMemoryBackend`] keeps objects in
//! process memory for development.

pub mod api;
pub mod config;
pub mod error;
pub mod intake;
pub mod memory_backend;
pub mod pipeline;
pub mod remote;
pub mod s3_backend;

pub use api::{AppState, ErrorResponse, PublishResponse};
pub use config::Config;
pub use error::{PublishError, RemoteCause};
pub use intake::{IntakeRecord, IntakeStore, NormalizedAsset, ReceiveError};
pub use memory_backend::InMemoryBackend;
pub use pipeline::{
    Orchestrator, PipelineFailure, PipelineOptions, PipelineStage, PublishOutcome,
};
pub use remote::{
    NewObject, PublicReference, ReferenceField, ReferenceResolver, RemoteBackend,
    RemoteObjectHandle, RemotePublisher, VisibilityManager,
};
pub use s3_backend::S3Backend;

//! Banana cultivar classifier.
//!
//! A request flows through a cascade of object-detection models:
//!
//! 1. A **gating** stage decides whether the image contains a banana at all.
//! 2. A **terminal** stage picks the cultivar.
//! 3. An optional **fallback** terminal model runs when the main one fails.
//!
//! The best terminal detection is mapped to a species key and returned as a
//! [`PipelineOutcome`]. Every failure mode has a stable machine-readable
//! [`FailureReason`].
//!
//! # Module Structure
//!
//! - `frame`: upload decoding and the owned pixel buffer (`PixelBuffer`, `InferenceView`)
//! - `detect`: model trait, loaders, registry, detections and NMS
//! - `classes`: class-id to species-key table
//! - `cascade`: the staged pipeline and its failure mapping
//! - `outcome`: response model and wire format
//! - `service`: startup wiring and per-mode dispatch
//! - `api`: HTTP transport

pub mod api;
pub mod cascade;
pub mod classes;
pub mod config;
pub mod context;
pub mod detect;
pub mod frame;
pub mod outcome;
pub mod service;

pub use cascade::{
    CascadeError, CascadePipeline, CascadeSpec, FallbackTrigger, StageKind, StageSpec,
    DEFAULT_ACCEPTANCE_THRESHOLD,
};
pub use classes::{ClassKeyTable, UnknownClassPolicy, UNKNOWN_SPECIES_KEY};
pub use config::{BananaConfig, LoadingMode};
pub use context::InferenceContext;
pub use detect::{
    Detection, DetectionModel, DetectionSet, InferenceParams, LoadPolicy, ModelLoader,
    ModelRegistry,
};
pub use frame::{decode_image, DecodeError, InferenceView, PixelBuffer};
pub use outcome::{Engine, FailureReason, PipelineOutcome};
pub use service::Classifier;

//! Batch preparation of DICOM studies for conversion and research use.
//!
//! Series are grouped and one canonical series is chosen per case, case
//! identities are resolved across heterogeneous sources and replaced by
//! surrogates, archives are extracted resumably, and converter sidecars are
//! reconciled with the metadata captured at scan time.

pub mod catalog;
pub mod config;
pub mod convert;
pub mod deid;
pub mod error;
pub mod extraction;
pub mod identity;
pub mod pipeline;
pub mod reconcile;
pub mod report;
pub mod selector;

pub use config::PipelineConfig;
pub use error::{FailureCategory, PipelineError};

//! # Veil Pipeline
//!
//! 研究装配与匿名化管线的核心：序列过滤、研究登记表、
//! 完成监视器、匿名化引擎与定稿编排。

pub mod anonymizer;
pub mod engine;
pub mod filter;
pub mod monitor;
pub mod registry;

pub use anonymizer::{AnonymizationProfile, FreshIdentifiers, TagAction, UidRemap};
pub use engine::PipelineEngine;
pub use filter::{AcquisitionKey, SeriesFilter, SeriesResolution, SeriesView};
pub use monitor::{CompletionMonitor, StudyFinalizer};
pub use registry::{MarkOutcome, RegistryTotals, StudyRegistry, UpsertOutcome};

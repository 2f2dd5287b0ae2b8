//! Passive BLE advertisements (GAP) carried by extended scan responses.

pub mod dedup;
pub mod parsers;
pub mod pipeline;
pub mod report;
pub mod vendor;

use serde::Serialize;

pub use dedup::RepeatFilter;
pub use pipeline::{AdvertisementPipeline, PipelineConfig};
pub use report::AdvertisementReport;
pub use vendor::{Tracker, Vendor};

/// A parsed advertisement with its decoded payloads, as published.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Advertisement {
    #[serde(flatten)]
    pub report: AdvertisementReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vendor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracker: Option<Tracker>,
}

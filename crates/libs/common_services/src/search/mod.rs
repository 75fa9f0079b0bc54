//! Derived full-text index over processed photos.

mod document;
mod index;
mod sync;

pub use document::{tokenize, IndexDocument};
pub use index::{InMemorySearchIndex, SearchIndex};
pub use sync::IndexSync;

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("search index unavailable: {0}")]
    Unavailable(String),
}

/// Inclusive bounds on a photo's capture date (upload date if unknown).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    #[must_use]
    pub fn contains(&self, date: DateTime<Utc>) -> bool {
        self.start.is_none_or(|start| date >= start) && self.end.is_none_or(|end| date <= end)
    }
}

/// Latitude/longitude box. A box whose `min_longitude` exceeds its
/// `max_longitude` wraps across the antimeridian.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBox {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

impl GeoBox {
    #[must_use]
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        if latitude < self.min_latitude || latitude > self.max_latitude {
            return false;
        }
        if self.min_longitude <= self.max_longitude {
            (self.min_longitude..=self.max_longitude).contains(&longitude)
        } else {
            longitude >= self.min_longitude || longitude <= self.max_longitude
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub date_range: Option<DateRange>,
    pub region: Option<GeoBox>,
}

impl SearchFilters {
    /// All set filters must pass. A photo without a location never passes a
    /// region filter.
    #[must_use]
    pub fn matches(&self, document: &IndexDocument) -> bool {
        if let Some(range) = &self.date_range
            && !range.contains(document.effective_date)
        {
            return false;
        }
        match (&self.region, &document.location) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(region), Some(point)) => region.contains(point.latitude, point.longitude),
        }
    }
}

#[derive(Debug, Clone, Builder)]
pub struct SearchQuery {
    /// Free text; tokens match label and text tokens by exact or prefix match.
    #[builder(into, default)]
    pub text: String,
    #[builder(default)]
    pub filters: SearchFilters,
    pub limit: Option<usize>,
}

//! Observations, targets and scans.

use serde::{Deserialize, Serialize};

use super::descriptor::UvDescriptor;
use super::visibility::{CubeLayout, VisibilitySample};

/// A field on the sky that was observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// 1-based AIPS source id
    pub id: u32,
    pub name: String,
    pub ra_deg: f64,
    pub dec_deg: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Observation-wide metadata supplied by the data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationMetadata {
    /// Capture block id
    pub id: String,
    #[serde(default)]
    pub observer: String,
    /// `YYYY-MM-DD`
    pub obs_date: String,
    /// Unix seconds of midnight UTC on `obs_date`
    pub reference_epoch: f64,
    /// Receiver band name, selects per-band imaging parameters
    pub band: String,
    pub reference_frequency: f64,
    pub channel_width: f64,
    pub nchan: usize,
    pub nstokes: usize,
    #[serde(default = "default_nif")]
    pub nif: usize,
    /// Antenna names in katdal order; AIPS number is index + 1
    pub antennas: Vec<String>,
    pub targets: Vec<Target>,
}

fn default_nif() -> usize {
    1
}

impl ObservationMetadata {
    /// Descriptor for the raw export of this observation.
    pub fn descriptor(&self) -> UvDescriptor {
        let mut desc = UvDescriptor::continuum(
            self.nstokes,
            self.nchan,
            self.nif,
            self.reference_frequency,
            self.channel_width,
        );
        desc.observer = self.observer.clone();
        desc.obs_date = self.obs_date.clone();
        desc.reference_epoch = self.reference_epoch;
        desc
    }

    pub fn target(&self, id: u32) -> Option<&Target> {
        self.targets.iter().find(|t| t.id == id)
    }
}

/// A scan as listed by the source, before its data is read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRef {
    /// Scan index within the observation
    pub index: u32,
    pub target_id: u32,
    /// Unix seconds
    pub start_time: f64,
    pub end_time: f64,
    /// Number of (time, baseline) samples
    pub samples: usize,
}

/// A scan with its data loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Scan {
    pub meta: ScanRef,
    pub layout: CubeLayout,
    pub samples: Vec<VisibilitySample>,
}

impl Scan {
    /// Earliest and latest sample times in days.
    pub fn time_range(&self) -> Option<(f32, f32)> {
        let mut iter = self.samples.iter().map(|s| s.params.time);
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t))))
    }
}

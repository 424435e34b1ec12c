//! Visibility samples and their in-memory cube layout.

use serde::{Deserialize, Serialize};

use super::descriptor::{AxisKind, RandomParameterKind, UvDescriptor};

/// Per-sample metadata written ahead of the visibility cube.
///
/// UVW are in wavelengths at the reference frequency, time in days from the
/// descriptor's reference epoch, baseline as an encoded AIPS baseline id.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RandomParameterSet {
    pub u: f32,
    pub v: f32,
    pub w: f32,
    pub baseline: f32,
    pub time: f32,
    pub source: f32,
    /// Seconds; only present in baseline-averaged files
    pub integration_time: Option<f32>,
}

impl RandomParameterSet {
    pub fn get(&self, kind: RandomParameterKind) -> Option<f32> {
        match kind {
            RandomParameterKind::U => Some(self.u),
            RandomParameterKind::V => Some(self.v),
            RandomParameterKind::W => Some(self.w),
            RandomParameterKind::Baseline => Some(self.baseline),
            RandomParameterKind::Time => Some(self.time),
            RandomParameterKind::Source => Some(self.source),
            RandomParameterKind::IntegrationTime => self.integration_time,
        }
    }

    /// Rebuild from values read in descriptor order.
    pub fn from_values(kinds: &[RandomParameterKind], values: &[f32]) -> Self {
        let mut params = RandomParameterSet::default();
        for (kind, value) in kinds.iter().zip(values) {
            match kind {
                RandomParameterKind::U => params.u = *value,
                RandomParameterKind::V => params.v = *value,
                RandomParameterKind::W => params.w = *value,
                RandomParameterKind::Baseline => params.baseline = *value,
                RandomParameterKind::Time => params.time = *value,
                RandomParameterKind::Source => params.source = *value,
                RandomParameterKind::IntegrationTime => params.integration_time = Some(*value),
            }
        }
        params
    }
}

/// In-memory axis order of visibility cubes, slowest axis first.
///
/// Sources hand over data in whatever order their storage uses; the
/// serializer maps it onto the descriptor's order. Axes of length 1 may be
/// omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CubeLayout {
    pub axes: Vec<(AxisKind, usize)>,
}

impl CubeLayout {
    pub fn new(axes: Vec<(AxisKind, usize)>) -> Self {
        Self { axes }
    }

    /// The layout a UV file stores: descriptor axes reversed, so the first
    /// declared axis is the innermost (fastest) one.
    pub fn file_order(descriptor: &UvDescriptor) -> Self {
        Self {
            axes: descriptor
                .axes
                .iter()
                .rev()
                .map(|a| (a.kind, a.length))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.axes.iter().map(|(_, n)| *n).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn axis_len(&self, kind: AxisKind) -> Option<usize> {
        self.axes.iter().find(|(k, _)| *k == kind).map(|(_, n)| *n)
    }
}

/// One (time, baseline) measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibilitySample {
    pub params: RandomParameterSet,
    /// Cube values in the owning scan's [`CubeLayout`]
    pub vis: Vec<f32>,
}

impl VisibilitySample {
    pub fn new(params: RandomParameterSet, vis: Vec<f32>) -> Self {
        Self { params, vis }
    }
}

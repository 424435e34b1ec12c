//! Published products: calibration solutions and sky models.

use serde::{Deserialize, Serialize};

/// Complex gain as a (real, imaginary) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComplexGain {
    pub re: f32,
    pub im: f32,
}

impl ComplexGain {
    pub fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }

    pub fn amplitude(&self) -> f32 {
        self.re.hypot(self.im)
    }
}

/// Gains for both polarizations at one solution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainSample {
    /// Unix seconds
    pub time: f64,
    pub gains: [ComplexGain; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntennaGains {
    /// Antenna name, e.g. `m012`
    pub antenna: String,
    pub samples: Vec<GainSample>,
}

/// Per-antenna complex gains versus time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSolution {
    pub target: String,
    /// False when self-calibration stopped on loop exhaustion
    pub converged: bool,
    pub antennas: Vec<AntennaGains>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ComponentShape {
    Point,
    Gaussian {
        major_deg: f64,
        minor_deg: f64,
        position_angle_deg: f64,
    },
}

/// One sky-model component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkyModelComponent {
    pub name: String,
    pub ra_deg: f64,
    pub dec_deg: f64,
    /// Jy at the reference frequency
    pub flux: f64,
    pub spectral_index: f64,
    pub shape: ComponentShape,
}

/// Clean-component model of a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkyModel {
    pub target: String,
    /// Hz
    pub reference_frequency: f64,
    pub converged: bool,
    pub components: Vec<SkyModelComponent>,
}

impl SkyModel {
    pub fn total_flux(&self) -> f64 {
        self.components.iter().map(|c| c.flux).sum()
    }
}

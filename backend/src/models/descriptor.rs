//! UV descriptor: the axis and random-parameter layout of a UV file.

use serde::{Deserialize, Serialize};

/// Regular axis of the visibility cube.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AxisKind {
    /// Real, imaginary, weight
    Complex,
    Stokes,
    Frequency,
    /// Spectral window ("IF")
    SpectralWindow,
    RightAscension,
    Declination,
}

impl AxisKind {
    /// FITS/AIPS `CTYPE` string.
    pub fn ctype(&self) -> &'static str {
        match self {
            AxisKind::Complex => "COMPLEX",
            AxisKind::Stokes => "STOKES",
            AxisKind::Frequency => "FREQ",
            AxisKind::SpectralWindow => "IF",
            AxisKind::RightAscension => "RA",
            AxisKind::Declination => "DEC",
        }
    }
}

/// One regular axis: kind, length and its world-coordinate keywords.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisSpec {
    pub kind: AxisKind,
    pub length: usize,
    /// CRVAL
    pub ref_value: f64,
    /// CRPIX
    pub ref_pixel: f64,
    /// CDELT
    pub increment: f64,
    /// CROTA
    pub rotation: f64,
}

impl AxisSpec {
    pub fn new(kind: AxisKind, length: usize, ref_value: f64, increment: f64) -> Self {
        Self {
            kind,
            length,
            ref_value,
            ref_pixel: 1.0,
            increment,
            rotation: 0.0,
        }
    }
}

/// Random parameter slot in a visibility record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RandomParameterKind {
    U,
    V,
    W,
    Baseline,
    Time,
    Source,
    /// Added by baseline-dependent averaging
    IntegrationTime,
}

impl RandomParameterKind {
    /// FITS/AIPS `PTYPE` string.
    pub fn ptype(&self) -> &'static str {
        match self {
            RandomParameterKind::U => "UU-L-SIN",
            RandomParameterKind::V => "VV-L-SIN",
            RandomParameterKind::W => "WW-L-SIN",
            RandomParameterKind::Baseline => "BASELINE",
            RandomParameterKind::Time => "TIME1",
            RandomParameterKind::Source => "SOURCE",
            RandomParameterKind::IntegrationTime => "INTTIM",
        }
    }

    /// Parameter list written by the exporter.
    pub fn standard() -> Vec<RandomParameterKind> {
        vec![
            RandomParameterKind::U,
            RandomParameterKind::V,
            RandomParameterKind::W,
            RandomParameterKind::Baseline,
            RandomParameterKind::Time,
            RandomParameterKind::Source,
        ]
    }
}

/// Layout and provenance of a UV file.
///
/// Axis order and lengths are fixed for the life of a file. The first axis
/// in `axes` varies fastest in the serialized cube.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UvDescriptor {
    pub object: String,
    pub telescope: String,
    pub observer: String,
    /// Observation date, `YYYY-MM-DD`
    pub obs_date: String,
    pub equinox: f64,
    /// Always `TB` (time, baseline) for pipeline output
    pub sort_order: String,
    /// Unix seconds of midnight UTC on `obs_date`; `TIME1` counts days from here
    pub reference_epoch: f64,
    pub axes: Vec<AxisSpec>,
    pub random_parameters: Vec<RandomParameterKind>,
}

impl UvDescriptor {
    /// Standard continuum layout: `COMPLEX, STOKES, FREQ, IF, RA, DEC`.
    ///
    /// STOKES follows AIPS Memo 117: `crval = 1` for a single product, `-5`
    /// (linear XX) otherwise, with `cdelt = -1`.
    pub fn continuum(
        nstokes: usize,
        nchan: usize,
        nif: usize,
        reference_frequency: f64,
        channel_width: f64,
    ) -> Self {
        let stokes_crval = if nstokes == 1 { 1.0 } else { -5.0 };
        Self {
            object: "MULTI".to_string(),
            telescope: "MeerKAT".to_string(),
            observer: String::new(),
            obs_date: String::new(),
            equinox: 2000.0,
            sort_order: "TB".to_string(),
            reference_epoch: 0.0,
            axes: vec![
                AxisSpec::new(AxisKind::Complex, 3, 1.0, 1.0),
                AxisSpec::new(AxisKind::Stokes, nstokes, stokes_crval, -1.0),
                AxisSpec::new(AxisKind::Frequency, nchan, reference_frequency, channel_width),
                AxisSpec::new(AxisKind::SpectralWindow, nif, 1.0, 1.0),
                AxisSpec::new(AxisKind::RightAscension, 1, 0.0, 0.0),
                AxisSpec::new(AxisKind::Declination, 1, 0.0, 0.0),
            ],
            random_parameters: RandomParameterKind::standard(),
        }
    }

    pub fn axis(&self, kind: AxisKind) -> Option<&AxisSpec> {
        self.axes.iter().find(|a| a.kind == kind)
    }

    pub fn axis_len(&self, kind: AxisKind) -> usize {
        self.axis(kind).map(|a| a.length).unwrap_or(1)
    }

    /// Number of random parameters per record (`nrparm`).
    pub fn nrparm(&self) -> usize {
        self.random_parameters.len()
    }

    /// Number of floats in one visibility cube.
    pub fn visibility_len(&self) -> usize {
        self.axes.iter().map(|a| a.length).product()
    }

    /// Floats per record (`lrec`).
    pub fn record_len(&self) -> usize {
        self.nrparm() + self.visibility_len()
    }

    pub fn record_bytes(&self) -> usize {
        self.record_len() * std::mem::size_of::<f32>()
    }

    pub fn parameter_index(&self, kind: RandomParameterKind) -> Option<usize> {
        self.random_parameters.iter().position(|p| *p == kind)
    }

    /// FREQ axis reference value in Hz.
    pub fn reference_frequency(&self) -> f64 {
        self.axis(AxisKind::Frequency)
            .map(|a| a.ref_value)
            .unwrap_or(0.0)
    }

    /// Speed of light over the reference frequency.
    pub fn reference_wavelength(&self) -> f64 {
        const SPEED_OF_LIGHT: f64 = 299_792_458.0;
        SPEED_OF_LIGHT / self.reference_frequency()
    }

    /// Check that records of `other` can be appended to a file with this layout.
    ///
    /// Provenance fields (object, observer) may differ; axes and random
    /// parameters must match exactly.
    pub fn check_compatible(&self, other: &UvDescriptor) -> Result<(), String> {
        if self.random_parameters != other.random_parameters {
            return Err(format!(
                "random parameters differ: {:?} vs {:?}",
                self.ptypes(),
                other.ptypes()
            ));
        }
        if self.axes.len() != other.axes.len() {
            return Err(format!(
                "axis count differs: {} vs {}",
                self.axes.len(),
                other.axes.len()
            ));
        }
        for (a, b) in self.axes.iter().zip(&other.axes) {
            if a != b {
                return Err(format!(
                    "axis {} differs: {:?} vs {:?}",
                    a.kind.ctype(),
                    a,
                    b
                ));
            }
        }
        Ok(())
    }

    pub fn ptypes(&self) -> Vec<&'static str> {
        self.random_parameters.iter().map(|p| p.ptype()).collect()
    }
}

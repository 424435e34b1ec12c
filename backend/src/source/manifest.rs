//! Observations exported to disk as a manifest plus raw scan files.
//!
//! ```text
//! <dir>/observation.json      metadata + scan list
//! <dir>/<scan file>           one record per (time, baseline) sample:
//!     time f64 | ant1 u16 | ant2 u16 | u v w f64 (metres) | cube f32 ...
//! ```
//!
//! All values are little-endian. Antennas are 0-based indices into the
//! metadata antenna list. The cube is `nchan x nstokes x 3` with the complex
//! (real, imaginary, weight) triple varying fastest.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use serde::{Deserialize, Serialize};

use super::{sort_scans, ObservationSource};
use crate::error::{ErrorContext, PipelineError, PipelineResult};
use crate::models::{
    time, AxisKind, CubeLayout, ObservationMetadata, RandomParameterSet, Scan, ScanRef,
    VisibilitySample,
};
use crate::uv::{aips_antenna, encode_baseline, metres_to_wavelengths};

pub const MANIFEST_FILE: &str = "observation.json";

/// Bytes ahead of the cube in each raw record.
const SAMPLE_HEADER_BYTES: usize = 8 + 2 + 2 + 3 * 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanManifest {
    #[serde(flatten)]
    pub scan: ScanRef,
    /// Relative to the manifest directory
    pub file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Manifest {
    metadata: ObservationMetadata,
    scans: Vec<ScanManifest>,
}

/// One raw (time, baseline) sample as stored in a scan file.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    /// Unix seconds
    pub time: f64,
    pub ant1: u16,
    pub ant2: u16,
    /// Metres
    pub uvw: [f64; 3],
    /// `(chan, stokes, complex)` order, complex fastest
    pub cube: Vec<f32>,
}

impl RawSample {
    fn write_to<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_f64::<LittleEndian>(self.time)?;
        out.write_u16::<LittleEndian>(self.ant1)?;
        out.write_u16::<LittleEndian>(self.ant2)?;
        for c in self.uvw {
            out.write_f64::<LittleEndian>(c)?;
        }
        for v in &self.cube {
            out.write_f32::<LittleEndian>(*v)?;
        }
        Ok(())
    }

    fn read_from<R: Read>(input: &mut R, cube_len: usize) -> std::io::Result<Self> {
        let time = input.read_f64::<LittleEndian>()?;
        let ant1 = input.read_u16::<LittleEndian>()?;
        let ant2 = input.read_u16::<LittleEndian>()?;
        let mut uvw = [0f64; 3];
        input.read_f64_into::<LittleEndian>(&mut uvw)?;
        let mut cube = vec![0f32; cube_len];
        input.read_f32_into::<LittleEndian>(&mut cube)?;
        Ok(Self {
            time,
            ant1,
            ant2,
            uvw,
            cube,
        })
    }
}

/// Reads an exported observation directory.
pub struct ManifestSource {
    root: PathBuf,
    manifest: Manifest,
}

impl ManifestSource {
    pub fn open(root: impl Into<PathBuf>) -> PipelineResult<Self> {
        let root = root.into();
        let path = root.join(MANIFEST_FILE);
        let bytes = std::fs::read(&path).map_err(|e| {
            PipelineError::io(e.to_string()).with_context(
                ErrorContext::new("open_manifest").with_details(path.display().to_string()),
            )
        })?;
        let manifest: Manifest = serde_json::from_slice(&bytes).map_err(|e| {
            PipelineError::format(format!("bad manifest: {}", e)).with_context(
                ErrorContext::new("open_manifest").with_details(path.display().to_string()),
            )
        })?;
        debug!(
            "Opened observation {} with {} scans",
            manifest.metadata.id,
            manifest.scans.len()
        );
        Ok(Self { root, manifest })
    }

    /// Export `scans` with their samples under `root`.
    pub fn write(
        root: &Path,
        metadata: &ObservationMetadata,
        scans: &[(ScanRef, Vec<RawSample>)],
    ) -> PipelineResult<()> {
        std::fs::create_dir_all(root)?;
        let mut entries = Vec::with_capacity(scans.len());
        for (scan, samples) in scans {
            let file = PathBuf::from(format!("scan_{:04}.raw", scan.index));
            let mut out = BufWriter::new(File::create(root.join(&file))?);
            for sample in samples {
                sample.write_to(&mut out)?;
            }
            out.flush()?;
            let mut scan = scan.clone();
            scan.samples = samples.len();
            entries.push(ScanManifest { scan, file });
        }
        let manifest = Manifest {
            metadata: metadata.clone(),
            scans: entries,
        };
        std::fs::write(
            root.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest)?,
        )?;
        Ok(())
    }

    fn cube_len(&self) -> usize {
        let meta = &self.manifest.metadata;
        meta.nchan * meta.nstokes * 3
    }

    fn to_sample(&self, raw: RawSample, source_id: u32, wavelength: f64) -> VisibilitySample {
        let epoch = self.manifest.metadata.reference_epoch;
        let params = RandomParameterSet {
            u: metres_to_wavelengths(raw.uvw[0], wavelength),
            v: metres_to_wavelengths(raw.uvw[1], wavelength),
            w: metres_to_wavelengths(raw.uvw[2], wavelength),
            baseline: encode_baseline(
                aips_antenna(raw.ant1 as usize),
                aips_antenna(raw.ant2 as usize),
            ),
            time: time::to_day_offset(raw.time, epoch) as f32,
            source: source_id as f32,
            integration_time: None,
        };
        VisibilitySample::new(params, raw.cube)
    }
}

impl ObservationSource for ManifestSource {
    fn metadata(&self) -> &ObservationMetadata {
        &self.manifest.metadata
    }

    fn scans(&self) -> Vec<ScanRef> {
        let mut scans: Vec<ScanRef> = self
            .manifest
            .scans
            .iter()
            .map(|s| s.scan.clone())
            .collect();
        sort_scans(&mut scans);
        scans
    }

    fn read_scan(&self, scan: &ScanRef) -> PipelineResult<Scan> {
        let context = || ErrorContext::new("read_scan").with_scan(scan.index);
        let entry = self
            .manifest
            .scans
            .iter()
            .find(|s| s.scan.index == scan.index)
            .ok_or_else(|| {
                PipelineError::io(format!("scan {} not in manifest", scan.index))
                    .with_context(context())
            })?;
        let path = self.root.join(&entry.file);
        let cube_len = self.cube_len();
        let record_bytes = (SAMPLE_HEADER_BYTES + cube_len * 4) as u64;
        let file_len = std::fs::metadata(&path)
            .map_err(|e| PipelineError::io(e.to_string()).with_context(context()))?
            .len();
        if file_len != record_bytes * entry.scan.samples as u64 {
            return Err(PipelineError::format(format!(
                "{} holds {} bytes, expected {} samples of {} bytes",
                path.display(),
                file_len,
                entry.scan.samples,
                record_bytes
            ))
            .with_context(context()));
        }

        let meta = &self.manifest.metadata;
        let wavelength = meta.descriptor().reference_wavelength();
        let mut input = BufReader::new(File::open(&path)?);
        let mut samples = Vec::with_capacity(entry.scan.samples);
        for _ in 0..entry.scan.samples {
            let raw = RawSample::read_from(&mut input, cube_len)
                .map_err(|e| PipelineError::io(e.to_string()).with_context(context()))?;
            samples.push(self.to_sample(raw, entry.scan.target_id, wavelength));
        }

        Ok(Scan {
            meta: entry.scan.clone(),
            layout: CubeLayout::new(vec![
                (AxisKind::Frequency, meta.nchan),
                (AxisKind::Stokes, meta.nstokes),
                (AxisKind::Complex, 3),
            ]),
            samples,
        })
    }
}

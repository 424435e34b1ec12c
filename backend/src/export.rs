//! Image product export.
//!
//! Every published target gets its final clean image copied into the export
//! directory as `<capture block>_<output id>_<target>_clean.fits`, carrying
//! the clean-component tables of the image and the solution tables of the
//! last self-calibration pass. After the last target two documents are
//! written next to the images:
//!
//! ```text
//! metadata.json     product description, one list entry per image
//! qa_report.json    per-target quality summary of the run
//! ```

use std::path::{Path, PathBuf};

use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorContext, PipelineError, PipelineResult};
use crate::models::{ObservationMetadata, Target};
use crate::selfcal::SelfCalProducts;
use crate::tables::{EngineTable, CLEAN_TABLE, SOLUTION_TABLE};
use crate::tracker::{RunReport, TargetStatus};

pub const FITS_EXT: &str = ".fits";
pub const METADATA_JSON: &str = "metadata.json";
pub const QA_REPORT_JSON: &str = "qa_report.json";

/// Last part of every exported image name.
const IMAGE_CLASS: &str = "clean";
const UNKNOWN: &str = "UNKNOWN";

/// Make `name` safe for a file name and distinct from everything in `used`.
///
/// Characters outside `[-A-Za-z0-9_]` become `_`; a repeated name gets a
/// `_1`, `_2`, ... suffix.
pub fn normalise_target_name(name: &str, used: &[String]) -> String {
    let base: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut candidate = base.clone();
    let mut suffix = 0;
    while used.contains(&candidate) {
        suffix += 1;
        candidate = format!("{}_{}", base, suffix);
    }
    candidate
}

/// `value` as `[-]D:MM:SS.s` with `decimals` digits of seconds.
fn sexagesimal(value: f64, decimals: u32) -> String {
    let sign = if value < 0.0 { "-" } else { "" };
    let scale = 10u64.pow(decimals);
    let units = (value.abs() * 3600.0 * scale as f64).round() as u64;
    let whole = units / (3600 * scale);
    let minutes = units / (60 * scale) % 60;
    let seconds = units % (60 * scale);
    let (secs, frac) = (seconds / scale, seconds % scale);
    if decimals == 0 {
        format!("{}{}:{:02}:{:02}", sign, whole, minutes, secs)
    } else {
        format!(
            "{}{}:{:02}:{:02}.{:0width$}",
            sign,
            whole,
            minutes,
            secs,
            frac,
            width = decimals as usize
        )
    }
}

/// Right ascension in hours, `H:MM:SS.ss`.
pub fn format_ra(ra_deg: f64) -> String {
    sexagesimal(ra_deg / 15.0, 2)
}

/// Declination in degrees, `D:MM:SS.s`.
pub fn format_dec(dec_deg: f64) -> String {
    sexagesimal(dec_deg, 1)
}

/// Target description in katpoint form: `name, radec tags, ra, dec`.
pub fn katpoint_description(target: &Target) -> String {
    let kind = std::iter::once("radec")
        .chain(target.tags.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "{}, {}, {}, {}",
        target.name,
        kind,
        format_ra(target.ra_deg),
        format_dec(target.dec_deg)
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProductType {
    pub product_type_name: String,
    pub reduction_name: String,
}

/// Contents of `metadata.json`. Per-image fields are parallel lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageMetadata {
    pub product_type: ProductType,
    /// Id of the first exported target
    pub run: String,
    /// Observation start, `YYYY-MM-DDTHH:MM:SSZ`
    pub start_time: String,
    pub capture_block_id: String,
    pub schedule_block_id_code: String,
    pub description: String,
    pub proposal_id: String,
    pub observer: String,
    #[serde(rename = "FITSImageFilename")]
    pub fits_image_filename: Vec<String>,
    /// Hours on target
    pub integration_time: Vec<f64>,
    #[serde(rename = "RMSNoise")]
    pub rms_noise: Vec<String>,
    pub right_ascension: Vec<String>,
    pub declination: Vec<String>,
    /// `dec,ra` in degrees
    pub dec_ra: Vec<String>,
    pub targets: Vec<String>,
    pub katpoint_targets: Vec<String>,
}

/// One image written by [`ImageExporter::export_image`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedImage {
    pub target: Target,
    /// Normalised target name used in the file name
    pub name: String,
    pub path: PathBuf,
    pub integration_hours: f64,
    /// Jy/beam
    pub rms: f64,
    pub dynamic_range: f64,
    pub solution_tables: usize,
}

impl ExportedImage {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Per-target line of `qa_report.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaTarget {
    pub target: String,
    pub status: TargetStatus,
    pub nvis: u64,
    pub scans_merged: usize,
    pub scans_dropped: usize,
    pub iterations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic_range: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rms_noise: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaReport {
    pub observation: String,
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub averaged_scans: usize,
    pub targets: Vec<QaTarget>,
}

/// Summarize `report`, taking image noise from `images`.
pub fn qa_report(report: &RunReport, images: &[ExportedImage]) -> QaReport {
    let targets = report
        .targets
        .values()
        .map(|t| {
            let image = images.iter().find(|i| i.target.name == t.name);
            QaTarget {
                target: t.name.clone(),
                status: t.status,
                nvis: t.nvis,
                scans_merged: t.scans_merged.len(),
                scans_dropped: t.scans_dropped.len(),
                iterations: t.iterations,
                dynamic_range: image.map(|i| i.dynamic_range).or(t.quality),
                rms_noise: image.map(|i| i.rms),
                image: image.map(ExportedImage::file_name),
                error: t.error.clone(),
            }
        })
        .collect();
    QaReport {
        observation: report.observation.clone(),
        generated_at: chrono::Utc::now(),
        averaged_scans: report.averaging_history.len(),
        targets,
    }
}

/// Writes image products of one run into a single directory.
pub struct ImageExporter {
    dir: PathBuf,
    capture_block_id: String,
    output_id: String,
    images: Mutex<Vec<ExportedImage>>,
}

impl ImageExporter {
    pub fn new(
        dir: impl Into<PathBuf>,
        capture_block_id: impl Into<String>,
        output_id: impl Into<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            capture_block_id: capture_block_id.into(),
            output_id: output_id.into(),
            images: Mutex::new(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn images(&self) -> Vec<ExportedImage> {
        self.images.lock().clone()
    }

    /// Copy the final image of `target` with its tables attached.
    pub fn export_image(
        &self,
        target: &Target,
        products: &SelfCalProducts,
        integration_hours: f64,
    ) -> PipelineResult<ExportedImage> {
        let context = || ErrorContext::new("export_image").with_target(&target.name);
        let io = |e: std::io::Error, path: &Path| {
            PipelineError::io(format!("{}: {}", path.display(), e)).with_context(context())
        };

        let mut images = self.images.lock();
        let used: Vec<String> = images.iter().map(|i| i.name.clone()).collect();
        let name = normalise_target_name(&target.name, &used);
        let base = [
            self.capture_block_id.as_str(),
            self.output_id.as_str(),
            name.as_str(),
            IMAGE_CLASS,
        ]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_");
        let path = self.dir.join(format!("{}{}", base, FITS_EXT));

        std::fs::create_dir_all(&self.dir).map_err(|e| io(e, &self.dir))?;
        std::fs::copy(&products.clean_image, &path).map_err(|e| io(e, &products.clean_image))?;
        EngineTable::copy_all(&products.clean_image, &path, CLEAN_TABLE)
            .map_err(|e| e.for_target(&target.name))?;
        let solution_tables = match &products.solution_uv {
            Some(uv) => EngineTable::copy_all(uv, &path, SOLUTION_TABLE)
                .map_err(|e| e.for_target(&target.name))?,
            None => 0,
        };
        info!(
            "Exported '{}' image to {} with {} solution tables",
            target.name,
            path.display(),
            solution_tables
        );

        let image = ExportedImage {
            target: target.clone(),
            name,
            path,
            integration_hours,
            rms: products.quality.rms,
            dynamic_range: products.quality.dynamic_range(),
            solution_tables,
        };
        images.push(image.clone());
        Ok(image)
    }

    /// Metadata of everything exported so far; `None` before the first image.
    pub fn metadata(
        &self,
        observation: &ObservationMetadata,
        start_time: f64,
    ) -> Option<ImageMetadata> {
        let images = self.images.lock();
        let first = images.first()?;
        let start = chrono::DateTime::from_timestamp(start_time.floor() as i64, 0)
            .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_else(|| UNKNOWN.to_string());
        let observer = if observation.observer.is_empty() {
            UNKNOWN.to_string()
        } else {
            observation.observer.clone()
        };

        let mut metadata = ImageMetadata {
            product_type: ProductType {
                product_type_name: "FITSImageProduct".to_string(),
                reduction_name: "Continuum Image".to_string(),
            },
            run: first.target.id.to_string(),
            start_time: start,
            capture_block_id: self.capture_block_id.clone(),
            schedule_block_id_code: UNKNOWN.to_string(),
            description: format!("{}: Continuum image", UNKNOWN),
            proposal_id: UNKNOWN.to_string(),
            observer,
            fits_image_filename: Vec::new(),
            integration_time: Vec::new(),
            rms_noise: Vec::new(),
            right_ascension: Vec::new(),
            declination: Vec::new(),
            dec_ra: Vec::new(),
            targets: Vec::new(),
            katpoint_targets: Vec::new(),
        };
        for image in images.iter() {
            let target = &image.target;
            metadata.fits_image_filename.push(image.file_name());
            metadata.integration_time.push(image.integration_hours);
            metadata.rms_noise.push(image.rms.to_string());
            metadata.right_ascension.push(format_ra(target.ra_deg));
            metadata.declination.push(format_dec(target.dec_deg));
            metadata
                .dec_ra
                .push(format!("{},{}", target.dec_deg, target.ra_deg));
            metadata.targets.push(image.name.clone());
            metadata.katpoint_targets.push(katpoint_description(target));
        }
        Some(metadata)
    }

    /// Write `metadata.json` and `qa_report.json`; returns the files written.
    pub fn finish(
        &self,
        observation: &ObservationMetadata,
        start_time: f64,
        report: &RunReport,
    ) -> PipelineResult<Vec<PathBuf>> {
        let mut written = Vec::new();
        std::fs::create_dir_all(&self.dir)?;
        match self.metadata(observation, start_time) {
            Some(metadata) => {
                let path = self.dir.join(METADATA_JSON);
                std::fs::write(&path, serde_json::to_vec_pretty(&metadata)?)?;
                info!("Wrote {}", path.display());
                written.push(path);
            }
            None => warn!("No images exported; not writing {}", METADATA_JSON),
        }
        let qa = qa_report(report, &self.images());
        let path = self.dir.join(QA_REPORT_JSON);
        std::fs::write(&path, serde_json::to_vec_pretty(&qa)?)?;
        info!("Wrote {}", path.display());
        written.push(path);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selfcal::QualityMetric;
    use crate::tables::{cell, TableRow};
    use crate::tracker::RunTracker;

    fn calibrator() -> Target {
        Target {
            id: 1,
            name: "PKS1934-63".to_string(),
            ra_deg: 294.854275,
            dec_deg: -63.712674,
            tags: vec!["bpcal".to_string()],
        }
    }

    fn products(dir: &Path, with_solutions: bool) -> SelfCalProducts {
        let clean_image = dir.join("PKS1934-63.clean.2.img");
        std::fs::write(&clean_image, b"SIMPLE  =                    T").unwrap();
        let mut cc = EngineTable::new(CLEAN_TABLE, 1);
        let mut row = TableRow::new();
        row.insert("FLUX".to_string(), cell(1.5));
        cc.rows.push(row);
        cc.write(&clean_image).unwrap();

        let solution_uv = with_solutions.then(|| {
            let uv = dir.join("PKS1934-63.mfimage.2.uv");
            std::fs::write(&uv, b"").unwrap();
            EngineTable::new(SOLUTION_TABLE, 1).write(&uv).unwrap();
            EngineTable::new(SOLUTION_TABLE, 2).write(&uv).unwrap();
            uv
        });
        SelfCalProducts {
            clean_image,
            solution_uv,
            converged: true,
            quality: QualityMetric {
                peak_flux: 5.0,
                peak_residual: 0.002,
                rms: 0.001,
            },
        }
    }

    #[test]
    fn test_normalise_target_name() {
        assert_eq!(normalise_target_name("PKS 1934-63", &[]), "PKS_1934-63");
        let used = vec!["J0408".to_string(), "J0408_1".to_string()];
        assert_eq!(normalise_target_name("J0408", &used), "J0408_2");
        assert_eq!(normalise_target_name("3C286+x", &used), "3C286_x");
    }

    #[test]
    fn test_coordinate_formatting() {
        assert_eq!(format_ra(294.854275), "19:39:25.03");
        assert_eq!(format_dec(-63.712674), "-63:42:45.6");
        // Rounding carries into the minutes
        assert_eq!(format_dec(10.0 + 59.0 / 60.0 + 59.99 / 3600.0), "11:00:00.0");
        assert_eq!(
            katpoint_description(&calibrator()),
            "PKS1934-63, radec bpcal, 19:39:25.03, -63:42:45.6"
        );
    }

    #[test]
    fn test_export_image_attaches_tables() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("fits");
        let exporter = ImageExporter::new(&out, "1551234567", "continuum_image");

        let image = exporter
            .export_image(&calibrator(), &products(dir.path(), true), 0.5)
            .unwrap();
        assert_eq!(
            image.file_name(),
            "1551234567_continuum_image_PKS1934-63_clean.fits"
        );
        assert_eq!(std::fs::read(&image.path).unwrap(), b"SIMPLE  =                    T");
        assert_eq!(EngineTable::versions(&image.path, CLEAN_TABLE), vec![1]);
        assert_eq!(EngineTable::versions(&image.path, SOLUTION_TABLE), vec![1, 2]);
        assert_eq!(image.solution_tables, 2);

        // Same target again gets a distinct file
        let again = exporter
            .export_image(&calibrator(), &products(dir.path(), false), 0.5)
            .unwrap();
        assert_eq!(again.name, "PKS1934-63_1");
        assert_eq!(again.solution_tables, 0);
        assert_eq!(exporter.images().len(), 2);
    }

    #[test]
    fn test_missing_image_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = ImageExporter::new(dir.path(), "cb", "");
        let mut missing = products(dir.path(), false);
        missing.clean_image = dir.path().join("gone.img");

        let err = exporter.export_image(&calibrator(), &missing, 1.0).unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }));
        assert_eq!(err.context().unwrap().target.as_deref(), Some("PKS1934-63"));
        assert!(exporter.images().is_empty());
    }

    #[test]
    fn test_metadata_and_qa_documents() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("fits");
        let exporter = ImageExporter::new(&out, "1551234567", "continuum_image");
        let observation = ObservationMetadata {
            id: "1551234567".to_string(),
            observer: String::new(),
            obs_date: "2019-02-27".to_string(),
            reference_epoch: 1_551_225_600.0,
            band: "L".to_string(),
            reference_frequency: 1.284e9,
            channel_width: 208_984.0,
            nchan: 4096,
            nstokes: 2,
            nif: 1,
            antennas: Vec::new(),
            targets: vec![calibrator()],
        };
        assert!(exporter.metadata(&observation, 1_551_234_567.0).is_none());

        exporter
            .export_image(&calibrator(), &products(dir.path(), true), 0.25)
            .unwrap();
        let tracker = RunTracker::new("1551234567_continuum_image");
        tracker.add_target("PKS1934-63");
        tracker.scan_merged("PKS1934-63", 1, 120);
        tracker.set_target_status("PKS1934-63", TargetStatus::Converged);

        let written = exporter
            .finish(&observation, 1_551_234_567.0, &tracker.snapshot())
            .unwrap();
        assert_eq!(written, vec![out.join(METADATA_JSON), out.join(QA_REPORT_JSON)]);

        let metadata: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.join(METADATA_JSON)).unwrap()).unwrap();
        assert_eq!(metadata["ProductType"]["ProductTypeName"], "FITSImageProduct");
        assert_eq!(metadata["StartTime"], "2019-02-27T02:29:27Z");
        assert_eq!(metadata["CaptureBlockId"], "1551234567");
        assert_eq!(metadata["Observer"], "UNKNOWN");
        assert_eq!(metadata["Run"], "1");
        assert_eq!(
            metadata["FITSImageFilename"][0],
            "1551234567_continuum_image_PKS1934-63_clean.fits"
        );
        assert_eq!(metadata["IntegrationTime"][0], 0.25);
        assert_eq!(metadata["RMSNoise"][0], "0.001");
        assert_eq!(metadata["DecRa"][0], "-63.712674,294.854275");
        assert_eq!(metadata["Targets"][0], "PKS1934-63");

        let qa: QaReport =
            serde_json::from_slice(&std::fs::read(out.join(QA_REPORT_JSON)).unwrap()).unwrap();
        assert_eq!(qa.targets.len(), 1);
        assert_eq!(qa.targets[0].status, TargetStatus::Converged);
        assert_eq!(qa.targets[0].nvis, 120);
        assert_eq!(qa.targets[0].rms_noise, Some(0.001));
        assert_eq!(qa.targets[0].dynamic_range, Some(5000.0));
    }
}

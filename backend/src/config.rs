//! Pipeline configuration file support.
//!
//! Configuration is read from TOML. Every field has a default, so an empty
//! file (or none at all) yields a runnable configuration for a small test
//! observation; production deployments set at least the disks and staging
//! capacity.
//!
//! ```toml
//! [disks]
//! staging = "/dev/shm/contim"
//! work = "/scratch/contim"
//!
//! [staging]
//! capacity_bytes = 68719476736
//! workers = 8
//!
//! [imaging.bands.wide_L]
//! quality_threshold = 2000.0
//! max_phase_loops = 3
//! max_amp_phase_loops = 1
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use obit_task::TaskParams;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorContext, PipelineError, PipelineResult};
use crate::models::ObservationMetadata;

/// Full pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub disks: DiskSettings,
    #[serde(default)]
    pub staging: StagingSettings,
    #[serde(default)]
    pub averaging: AveragingSettings,
    #[serde(default)]
    pub imaging: ImagingSettings,
    #[serde(default)]
    pub obit: ObitSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

/// Disk roots. The staging disk is catalog disk 1, the work disk is disk 2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSettings {
    #[serde(default = "default_staging_disk")]
    pub staging: PathBuf,
    #[serde(default = "default_work_disk")]
    pub work: PathBuf,
}

impl Default for DiskSettings {
    fn default() -> Self {
        Self {
            staging: default_staging_disk(),
            work: default_work_disk(),
        }
    }
}

fn default_staging_disk() -> PathBuf {
    PathBuf::from("/dev/shm/contim")
}

fn default_work_disk() -> PathBuf {
    PathBuf::from("/var/tmp/contim")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingSettings {
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: u64,
    /// Concurrent scan workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Longest a scan may wait for staging space before the run aborts
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

impl Default for StagingSettings {
    fn default() -> Self {
        Self {
            capacity_bytes: default_capacity_bytes(),
            workers: default_workers(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

impl StagingSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

fn default_capacity_bytes() -> u64 {
    8 * 1024 * 1024 * 1024
}

fn default_workers() -> usize {
    4
}

fn default_acquire_timeout() -> u64 {
    3600
}

/// `UVBlAvg` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AveragingSettings {
    /// When false, raw scans are concatenated without averaging
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Field of view in degrees
    #[serde(default = "default_avg_fov")]
    pub fov: f64,
    /// Maximum averaging interval in minutes
    #[serde(default = "default_max_int")]
    pub max_int: f64,
    /// Maximum amplitude loss factor
    #[serde(default = "default_max_fact")]
    pub max_fact: f64,
    /// Frequency averaging mode; derived from the channel count when unset
    #[serde(default)]
    pub avg_freq: Option<u32>,
    /// Channels to average; derived from the channel count when unset
    #[serde(default)]
    pub ch_avg: Option<u32>,
    #[serde(default = "default_avg_timeout")]
    pub timeout_secs: u64,
    /// Retries after the first failed attempt
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Extra task parameters in `key=value; ...` form, applied last
    #[serde(default)]
    pub overrides: String,
}

impl Default for AveragingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            fov: default_avg_fov(),
            max_int: default_max_int(),
            max_fact: default_max_fact(),
            avg_freq: None,
            ch_avg: None,
            timeout_secs: default_avg_timeout(),
            retries: default_retries(),
            overrides: String::new(),
        }
    }
}

impl AveragingSettings {
    /// Resolve `(avgFreq, chAvg)` for an observation with `nchan` channels.
    ///
    /// Unset values aim for roughly 1024 output channels: a factor of
    /// `nchan / 1024` when that exceeds 1, otherwise no frequency averaging.
    pub fn channel_averaging(&self, nchan: usize) -> (u32, u32) {
        let factor = (nchan / 1024) as u32;
        let (auto_freq, auto_ch) = if factor > 1 { (1, factor) } else { (0, 1) };
        (
            self.avg_freq.unwrap_or(auto_freq),
            self.ch_avg.unwrap_or(auto_ch),
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn override_params(&self) -> PipelineResult<TaskParams> {
        parse_overrides("averaging.overrides", &self.overrides)
    }
}

fn default_true() -> bool {
    true
}

fn default_avg_fov() -> f64 {
    1.0
}

fn default_max_int() -> f64 {
    2.0
}

fn default_max_fact() -> f64 {
    1.01
}

fn default_avg_timeout() -> u64 {
    3600
}

fn default_retries() -> u32 {
    1
}

/// Imaging and self-calibration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagingSettings {
    #[serde(default = "default_img_timeout")]
    pub timeout_secs: u64,
    /// Fallback for bands without their own section
    #[serde(default)]
    pub default: BandSettings,
    /// Keyed by `<narrow|wide>_<band>`, e.g. `wide_L`
    #[serde(default)]
    pub bands: HashMap<String, BandSettings>,
    /// Extra `MFImage` parameters in `key=value; ...` form, applied last
    #[serde(default)]
    pub overrides: String,
}

impl Default for ImagingSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_img_timeout(),
            default: BandSettings::default(),
            bands: HashMap::new(),
            overrides: String::new(),
        }
    }
}

impl ImagingSettings {
    /// Bandwidths below this are "narrow" mode.
    pub const NARROW_BANDWIDTH_HZ: f64 = 200.0e6;

    /// Parameter-set key for an observation: `<narrow|wide>_<band>`.
    pub fn band_key(metadata: &ObservationMetadata) -> String {
        let bandwidth = (metadata.channel_width * metadata.nchan as f64).abs();
        let mode = if bandwidth < Self::NARROW_BANDWIDTH_HZ {
            "narrow"
        } else {
            "wide"
        };
        format!("{}_{}", mode, metadata.band)
    }

    /// Settings for `key`, falling back to a bare band name, then the default.
    pub fn for_band(&self, key: &str) -> &BandSettings {
        self.bands
            .get(key)
            .or_else(|| {
                key.split_once('_')
                    .and_then(|(_, band)| self.bands.get(band))
            })
            .unwrap_or(&self.default)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn override_params(&self) -> PipelineResult<TaskParams> {
        parse_overrides("imaging.overrides", &self.overrides)
    }
}

fn default_img_timeout() -> u64 {
    24 * 3600
}

/// Per-band self-calibration and imaging parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandSettings {
    /// Dynamic range (peak / rms) at which imaging counts as converged
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    #[serde(default = "default_phase_loops")]
    pub max_phase_loops: u32,
    #[serde(default = "default_amp_phase_loops")]
    pub max_amp_phase_loops: u32,
    /// Field of view in degrees
    #[serde(default = "default_img_fov")]
    pub fov: f64,
    #[serde(default = "default_niter")]
    pub niter: u32,
    #[serde(default)]
    pub min_flux_psc: f64,
    #[serde(default)]
    pub min_flux_asc: f64,
    /// Phase solution interval in minutes
    #[serde(default = "default_sol_p_int")]
    pub sol_p_int: f64,
    /// Amplitude+phase solution interval in minutes
    #[serde(default = "default_sol_a_int")]
    pub sol_a_int: f64,
    /// AIPS reference antenna; 0 lets the engine choose
    #[serde(default)]
    pub ref_ant: u32,
}

impl Default for BandSettings {
    fn default() -> Self {
        Self {
            quality_threshold: default_quality_threshold(),
            max_phase_loops: default_phase_loops(),
            max_amp_phase_loops: default_amp_phase_loops(),
            fov: default_img_fov(),
            niter: default_niter(),
            min_flux_psc: 0.0,
            min_flux_asc: 0.0,
            sol_p_int: default_sol_p_int(),
            sol_a_int: default_sol_a_int(),
            ref_ant: 0,
        }
    }
}

fn default_quality_threshold() -> f64 {
    1000.0
}

fn default_phase_loops() -> u32 {
    3
}

fn default_amp_phase_loops() -> u32 {
    1
}

fn default_img_fov() -> f64 {
    1.2
}

fn default_niter() -> u32 {
    5000
}

fn default_sol_p_int() -> f64 {
    4.0
}

fn default_sol_a_int() -> f64 {
    10.0
}

/// Obit installation and task verbosity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObitSettings {
    #[serde(default = "default_exec_dir")]
    pub exec_dir: PathBuf,
    /// `prtLv` passed to every task
    #[serde(default = "default_prt_lv")]
    pub prt_lv: i64,
}

impl Default for ObitSettings {
    fn default() -> Self {
        Self {
            exec_dir: default_exec_dir(),
            prt_lv: default_prt_lv(),
        }
    }
}

fn default_exec_dir() -> PathBuf {
    PathBuf::from("/usr/local/obit/bin")
}

fn default_prt_lv() -> i64 {
    2
}

/// State store backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(rename = "type", default = "default_store_type")]
    pub store_type: String,
    /// Document path for the file backend
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            store_type: default_store_type(),
            path: None,
        }
    }
}

fn default_store_type() -> String {
    "local".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Label appended to the observation id in state-store keys
    #[serde(default = "default_output_id")]
    pub output_id: String,
    /// Catalog classes deleted after a target is published
    /// (`merge`, `clean`, `mfimage`)
    #[serde(default)]
    pub clobber: Vec<String>,
    /// FITS images, `metadata.json` and `qa_report.json` go here when set
    #[serde(default)]
    pub export_dir: Option<PathBuf>,
    #[serde(default)]
    pub mode: RunMode,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            output_id: default_output_id(),
            clobber: Vec::new(),
            export_dir: None,
            mode: RunMode::default(),
        }
    }
}

/// How far a run goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Merge, self-calibrate, publish and export
    #[default]
    Image,
    /// Stop after the per-target merge and keep the merged files
    ExportOnly,
}

fn default_output_id() -> String {
    "continuum_image".to_string()
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            PipelineError::configuration(format!("Failed to read config file: {}", e))
                .with_context(config_context(path.as_ref()))
        })?;
        Self::from_toml(&content).map_err(|e| e.with_context(config_context(path.as_ref())))
    }

    pub fn from_toml(content: &str) -> PipelineResult<Self> {
        let config: PipelineConfig = toml::from_str(content).map_err(|e| {
            PipelineError::configuration(format!("Failed to parse config file: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location.
    ///
    /// Searches for `contim.toml` in:
    /// 1. Current directory
    /// 2. `backend/` directory
    /// 3. Parent directory
    pub fn from_default_location() -> PipelineResult<Self> {
        let search_paths = [
            PathBuf::from("contim.toml"),
            PathBuf::from("backend/contim.toml"),
            PathBuf::from("../contim.toml"),
        ];

        for path in search_paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(PipelineError::configuration(
            "No contim.toml found in standard locations",
        ))
    }

    /// Apply `OBIT_EXEC_DIR`, `STATE_STORE_TYPE` and `STATE_STORE_PATH`.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("OBIT_EXEC_DIR") {
            self.obit.exec_dir = PathBuf::from(dir);
        }
        if let Ok(store_type) = std::env::var("STATE_STORE_TYPE") {
            self.store.store_type = store_type;
        }
        if let Ok(path) = std::env::var("STATE_STORE_PATH") {
            self.store.path = Some(PathBuf::from(path));
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> PipelineResult<()> {
        let invalid = |msg: String| {
            Err(PipelineError::configuration(msg).with_context(ErrorContext::new("validate_config")))
        };

        if self.staging.workers == 0 {
            return invalid("staging.workers must be at least 1".to_string());
        }
        if self.staging.capacity_bytes < crate::staging::GRANULE_BYTES {
            return invalid(format!(
                "staging.capacity_bytes of {} is below one granule",
                self.staging.capacity_bytes
            ));
        }
        if self.averaging.fov <= 0.0 || self.averaging.max_int <= 0.0 {
            return invalid("averaging.fov and averaging.max_int must be positive".to_string());
        }
        for (name, band) in
            std::iter::once(("default", &self.imaging.default)).chain(
                self.imaging.bands.iter().map(|(k, v)| (k.as_str(), v)),
            )
        {
            if band.quality_threshold.is_nan() || band.quality_threshold <= 0.0 {
                return invalid(format!(
                    "imaging band {}: quality_threshold must be positive",
                    name
                ));
            }
        }
        for class in &self.output.clobber {
            if !matches!(class.as_str(), "merge" | "clean" | "mfimage") {
                return invalid(format!("unknown clobber class '{}'", class));
            }
        }
        if self.output.mode == RunMode::ExportOnly
            && self.output.clobber.iter().any(|c| c == "merge")
        {
            return invalid(
                "export_only mode keeps merged files; drop 'merge' from clobber".to_string(),
            );
        }
        self.averaging.override_params()?;
        self.imaging.override_params()?;
        Ok(())
    }
}

fn parse_overrides(field: &str, raw: &str) -> PipelineResult<TaskParams> {
    TaskParams::parse_assignments(raw).map_err(|e| {
        PipelineError::configuration(format!("{}: {}", field, e))
            .with_context(ErrorContext::new("parse_overrides"))
    })
}

fn config_context(path: &Path) -> ErrorContext {
    ErrorContext::new("load_config").with_details(path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert_eq!(config.staging.workers, 4);
        assert_eq!(config.averaging.fov, 1.0);
        assert_eq!(config.averaging.max_int, 2.0);
        assert_eq!(config.imaging.default.niter, 5000);
        assert_eq!(config.imaging.default.sol_p_int, 4.0);
        assert_eq!(config.store.store_type, "local");
    }

    #[test]
    fn test_band_sections() {
        let config = PipelineConfig::from_toml(
            r#"
            [imaging.default]
            quality_threshold = 500.0

            [imaging.bands.wide_L]
            quality_threshold = 2000.0
            max_phase_loops = 2

            [imaging.bands.UHF]
            max_amp_phase_loops = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.imaging.for_band("wide_L").quality_threshold, 2000.0);
        assert_eq!(config.imaging.for_band("wide_L").max_phase_loops, 2);
        assert_eq!(config.imaging.for_band("narrow_UHF").max_amp_phase_loops, 0);
        assert_eq!(config.imaging.for_band("wide_S").quality_threshold, 500.0);
    }

    #[test]
    fn test_channel_averaging_defaults() {
        let settings = AveragingSettings::default();
        assert_eq!(settings.channel_averaging(32768), (1, 32));
        assert_eq!(settings.channel_averaging(4096), (1, 4));
        assert_eq!(settings.channel_averaging(2048), (1, 2));
        assert_eq!(settings.channel_averaging(1024), (0, 1));

        let explicit = AveragingSettings {
            ch_avg: Some(8),
            avg_freq: Some(1),
            ..Default::default()
        };
        assert_eq!(explicit.channel_averaging(32768), (1, 8));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(PipelineConfig::from_toml("[staging]\nworkers = 0").is_err());
        assert!(PipelineConfig::from_toml("[output]\nclobber = [\"scans\"]").is_err());
        assert!(PipelineConfig::from_toml("[averaging]\noverrides = \"FOV\"").is_err());
        assert!(PipelineConfig::from_toml(
            "[output]\nmode = \"export_only\"\nclobber = [\"merge\"]"
        )
        .is_err());
        let err = PipelineConfig::from_toml("[imaging.default]\nquality_threshold = 0.0")
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration { .. }));
    }

    #[test]
    fn test_output_modes() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert_eq!(config.output.mode, RunMode::Image);
        assert!(config.output.export_dir.is_none());

        let config = PipelineConfig::from_toml(
            "[output]\nmode = \"export_only\"\nexport_dir = \"/data/fits\"\nclobber = [\"clean\"]",
        )
        .unwrap();
        assert_eq!(config.output.mode, RunMode::ExportOnly);
        assert_eq!(config.output.export_dir, Some(PathBuf::from("/data/fits")));
        assert!(PipelineConfig::from_toml("[output]\nmode = \"offline\"").is_err());
    }

    #[test]
    fn test_from_file_missing() {
        let err = PipelineConfig::from_file("/nonexistent/contim.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}

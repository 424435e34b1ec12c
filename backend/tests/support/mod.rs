#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use obit_task::{TaskOutcome, TaskRunner, TaskSpec};

use contim::config::PipelineConfig;
use contim::models::{
    time, AxisKind, CubeLayout, ObservationMetadata, RandomParameterKind, RandomParameterSet,
    Scan, ScanRef, Target, VisibilitySample,
};
use contim::source::MemorySource;
use contim::tables::{cell, EngineTable, Keyword, TableRow, CLEAN_TABLE, SOLUTION_TABLE};
use contim::uv::{encode_baseline, UvReader, UvWriter};

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Run `f` with the given variables set (`Some`) or removed (`None`).
///
/// Holds a process-wide lock for the duration and restores the previous
/// values afterwards, even if `f` panics.
pub fn with_scoped_env<F, R>(changes: &[(&str, Option<&str>)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let _restore = EnvRestore::apply(changes);
    f()
}

struct EnvRestore {
    saved: Vec<(String, Option<String>)>,
}

impl EnvRestore {
    fn apply(changes: &[(&str, Option<&str>)]) -> Self {
        let names: BTreeSet<&str> = changes.iter().map(|(name, _)| *name).collect();
        let saved = names
            .into_iter()
            .map(|name| (name.to_string(), std::env::var(name).ok()))
            .collect();
        for (name, value) in changes {
            set_or_remove(name, *value);
        }
        Self { saved }
    }
}

impl Drop for EnvRestore {
    fn drop(&mut self) {
        for (name, value) in &self.saved {
            set_or_remove(name, value.as_deref());
        }
    }
}

fn set_or_remove(name: &str, value: Option<&str>) {
    match value {
        Some(value) => std::env::set_var(name, value),
        None => std::env::remove_var(name),
    }
}

pub const CAPTURE_BLOCK: &str = "1551234567";
pub const EPOCH: f64 = 1_551_225_600.0;
pub const NCHAN: usize = 4;
pub const NSTOKES: usize = 2;
/// Seconds between samples of a scan
pub const DUMP_SECS: f64 = 8.0;

pub fn calibrator() -> Target {
    Target {
        id: 1,
        name: "PKS1934-63".to_string(),
        ra_deg: 294.854275,
        dec_deg: -63.712674,
        tags: vec!["bpcal".to_string()],
    }
}

pub fn field() -> Target {
    Target {
        id: 2,
        name: "J0408-6545".to_string(),
        ra_deg: 62.084913,
        dec_deg: -65.752522,
        tags: vec!["target".to_string()],
    }
}

pub fn metadata() -> ObservationMetadata {
    ObservationMetadata {
        id: CAPTURE_BLOCK.to_string(),
        observer: "test".to_string(),
        obs_date: "2019-02-27".to_string(),
        reference_epoch: EPOCH,
        band: "L".to_string(),
        reference_frequency: 1.284e9,
        channel_width: 1.0e6,
        nchan: NCHAN,
        nstokes: NSTOKES,
        nif: 1,
        antennas: vec!["m000".into(), "m001".into(), "m002".into()],
        targets: vec![calibrator(), field()],
    }
}

/// `TIME1` of sample `k` of a scan starting `start` seconds after midnight.
pub fn sample_time(start: f64, k: usize) -> f32 {
    time::to_day_offset(EPOCH + start + k as f64 * DUMP_SECS, EPOCH) as f32
}

/// A scan of `samples` dumps on baseline 1-2 whose cube values encode
/// the sample and element index.
pub fn scan(index: u32, target_id: u32, start: f64, samples: usize) -> Scan {
    let layout = CubeLayout::new(vec![
        (AxisKind::Frequency, NCHAN),
        (AxisKind::Stokes, NSTOKES),
        (AxisKind::Complex, 3),
    ]);
    let cube_len = layout.len();
    let samples: Vec<VisibilitySample> = (0..samples)
        .map(|k| {
            let params = RandomParameterSet {
                u: 100.0 + k as f32,
                v: -50.0,
                w: 1.0,
                baseline: encode_baseline(1, 2),
                time: sample_time(start, k),
                source: target_id as f32,
                integration_time: None,
            };
            let vis = (0..cube_len).map(|i| (k * 1000 + i) as f32).collect();
            VisibilitySample::new(params, vis)
        })
        .collect();
    Scan {
        meta: ScanRef {
            index,
            target_id,
            start_time: EPOCH + start,
            end_time: EPOCH + start + samples.len() as f64 * DUMP_SECS,
            samples: samples.len(),
        },
        layout,
        samples,
    }
}

pub fn source(scans: Vec<Scan>) -> MemorySource {
    scans
        .into_iter()
        .fold(MemorySource::new(metadata()), |source, scan| source.with_scan(scan))
}

/// Config with both disks under `root` and small staging.
pub fn config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.disks.staging = root.join("staging");
    config.disks.work = root.join("work");
    config.staging.capacity_bytes = 1 << 20;
    config.staging.workers = 2;
    config.staging.acquire_timeout_secs = 30;
    config.imaging.default.quality_threshold = 1000.0;
    config.imaging.default.max_phase_loops = 3;
    config.imaging.default.max_amp_phase_loops = 1;
    config
}

/// Image noise written by the fake imager; peak flux is `rms * dynamic range`.
pub const IMAGE_RMS: f64 = 0.001;

#[derive(Default)]
struct FakeState {
    calls: Vec<TaskSpec>,
    imaging_calls: u32,
    /// First `TIME1` of each scan whose averaging finished, in finish order
    averaged: Vec<f32>,
}

/// Stand-in for the Obit executables.
///
/// `UVBlAvg` keeps every other record and adds `INTTIM`; it fails for any
/// input whose first `TIME1` is in `poisoned`. `MFImage` writes a clean
/// component table whose dynamic range follows `dynamic_ranges` (the last
/// entry repeats) and a solution table next to the calibrated output.
pub struct FakeObit {
    poisoned: Vec<f32>,
    delayed: Vec<(f32, Duration)>,
    dynamic_ranges: Vec<f64>,
    fail_imaging_call: Option<u32>,
    state: Mutex<FakeState>,
}

impl FakeObit {
    pub fn new(dynamic_ranges: Vec<f64>) -> Self {
        Self {
            poisoned: Vec::new(),
            delayed: Vec::new(),
            dynamic_ranges,
            fail_imaging_call: None,
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Make averaging fail for the scan whose first sample is at `start`.
    pub fn poison_scan(mut self, start: f64) -> Self {
        self.poisoned.push(sample_time(start, 0));
        self
    }

    /// Hold back averaging of the scan whose first sample is at `start`.
    pub fn delay_scan(mut self, start: f64, delay: Duration) -> Self {
        self.delayed.push((sample_time(start, 0), delay));
        self
    }

    /// First sample times of the averaged scans, in the order averaging finished.
    pub fn averaging_order(&self) -> Vec<f32> {
        self.state.lock().unwrap().averaged.clone()
    }

    /// Make the `call`-th (1-based) imaging invocation exit non-zero.
    pub fn fail_imaging_on(mut self, call: u32) -> Self {
        self.fail_imaging_call = Some(call);
        self
    }

    pub fn calls(&self, task: &str) -> Vec<TaskSpec> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|s| s.name == task)
            .cloned()
            .collect()
    }

    fn average(&self, spec: &TaskSpec) -> TaskOutcome {
        let input = path_param(spec, "inFile");
        let output = path_param(spec, "outFile");
        let mut reader = UvReader::open(&input).unwrap();
        let mut descriptor = reader.descriptor().clone();
        let records = reader.read_all().unwrap();
        let first_time = records.first().map(|(params, _)| params.time);
        if let Some(first) = first_time {
            if self.poisoned.contains(&first) {
                return TaskOutcome::failed(1);
            }
        }

        if descriptor
            .parameter_index(RandomParameterKind::IntegrationTime)
            .is_none()
        {
            descriptor
                .random_parameters
                .push(RandomParameterKind::IntegrationTime);
        }
        let mut writer = UvWriter::create(&output, descriptor).unwrap();
        for (mut params, vis) in records.into_iter().step_by(2) {
            params.integration_time = Some((2.0 * DUMP_SECS) as f32);
            writer.write_record(&params, &vis).unwrap();
        }
        writer.finish().unwrap();
        if let Some(first) = first_time {
            self.state.lock().unwrap().averaged.push(first);
        }
        TaskOutcome::success(vec!["UVBlAvg: averaging complete".to_string()])
    }

    fn image(&self, spec: &TaskSpec, call: u32) -> TaskOutcome {
        if self.fail_imaging_call == Some(call) {
            return TaskOutcome::failed(3);
        }
        let input = path_param(spec, "inFile");
        let clean_image = path_param(spec, "outFile");
        let uv_output = path_param(spec, "out2File");

        let index = (call as usize - 1).min(self.dynamic_ranges.len() - 1);
        let mut cc = EngineTable::new(CLEAN_TABLE, 1);
        cc.set_keyword("PEAKFLUX", Keyword::double(self.dynamic_ranges[index] * IMAGE_RMS));
        cc.set_keyword("PEAKRES", Keyword::double(IMAGE_RMS * 2.0));
        cc.set_keyword("IMRMS", Keyword::double(IMAGE_RMS));
        cc.rows = vec![
            clean_component(0.0, 0.0, 1.5),
            clean_component(0.01, -0.02, 0.25),
        ];
        std::fs::write(&clean_image, b"image").unwrap();
        cc.write(&clean_image).unwrap();

        std::fs::copy(&input, &uv_output).unwrap();
        let mut sn = EngineTable::new(SOLUTION_TABLE, 1);
        sn.rows = vec![
            solution_row(1, 0.5, call as f64),
            solution_row(2, 0.5, call as f64),
        ];
        sn.write(&uv_output).unwrap();
        TaskOutcome::success(vec![format!("MFImage: pass {} done", call)])
    }
}

#[async_trait]
impl TaskRunner for FakeObit {
    async fn run(&self, spec: &TaskSpec) -> obit_task::Result<TaskOutcome> {
        let imaging_call = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(spec.clone());
            if spec.name == "MFImage" {
                state.imaging_calls += 1;
            }
            state.imaging_calls
        };
        if spec.name == "UVBlAvg" {
            if let Some(delay) = self.delay_for(spec) {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(match spec.name.as_str() {
            "UVBlAvg" => self.average(spec),
            "MFImage" => self.image(spec, imaging_call),
            _ => TaskOutcome::failed(127),
        })
    }
}

impl FakeObit {
    fn delay_for(&self, spec: &TaskSpec) -> Option<Duration> {
        if self.delayed.is_empty() {
            return None;
        }
        let records = UvReader::open(&path_param(spec, "inFile"))
            .unwrap()
            .read_all()
            .unwrap();
        let first = records.first()?.0.time;
        self.delayed
            .iter()
            .find(|(time, _)| *time == first)
            .map(|(_, delay)| *delay)
    }
}

fn path_param(spec: &TaskSpec, name: &str) -> PathBuf {
    PathBuf::from(spec.params.get_str(name).unwrap())
}

fn clean_component(dx: f64, dy: f64, flux: f64) -> TableRow {
    let mut row = TableRow::new();
    row.insert("DELTAX".into(), cell(dx));
    row.insert("DELTAY".into(), cell(dy));
    row.insert("FLUX".into(), cell(flux));
    row
}

fn solution_row(antenna: i64, time: f64, gain: f64) -> TableRow {
    let mut row = TableRow::new();
    row.insert("ANTENNA NO.".into(), cell(antenna));
    row.insert("TIME".into(), cell(time));
    row.insert("REAL1".into(), cell(gain));
    row.insert("IMAG1".into(), cell(0.0));
    row.insert("REAL2".into(), cell(gain));
    row.insert("IMAG2".into(), cell(0.0));
    row
}

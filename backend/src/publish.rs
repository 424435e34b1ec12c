//! Solution publishing.
//!
//! Turns the engine's solution (`AIPS SN`) and clean-component (`AIPS CC`)
//! tables into [`CalibrationSolution`] and [`SkyModel`] values and writes
//! them to the state store:
//!
//! ```text
//! <observation>:<target>:calibration_solutions
//! <observation>:<target>:sky_model
//! <observation>:failures                  target -> FailureRecord
//! ```

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use obit_task::TaskStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorContext, PipelineError, PipelineResult};
use crate::models::{
    time, AntennaGains, CalibrationSolution, ComplexGain, ComponentShape, GainSample,
    ObservationMetadata, SkyModel, SkyModelComponent, Target,
};
use crate::selfcal::SelfCalProducts;
use crate::store::checksum::value_checksum;
use crate::store::{StateKey, StateStore, StoreResult};
use crate::tables::{row_f64, row_f64s, EngineTable, TableRow, CLEAN_TABLE, SOLUTION_TABLE};
use crate::uv::antenna_name;

pub const SOLUTIONS_KEY: &str = "calibration_solutions";
pub const SKY_MODEL_KEY: &str = "sky_model";
pub const FAILURES_KEY: &str = "failures";

/// Tries per store write before a retryable error is given up on.
const STORE_ATTEMPTS: u32 = 3;
const STORE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// `PARMS[3]` of a tabulated clean component; per-plane fluxes follow.
const TABULATED_TYPE: f64 = 20.0;

/// Why a target produced nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub target: String,
    pub kind: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<TaskStatus>,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

impl FailureRecord {
    pub fn from_error(target: &str, error: &PipelineError) -> Self {
        let context = error.context();
        Self {
            target: target.to_string(),
            kind: error.kind().to_string(),
            error: error.to_string(),
            iteration: context.and_then(|c| c.iteration),
            exit_status: context.and_then(|c| c.exit_status),
            recorded_at: chrono::Utc::now(),
        }
    }
}

/// Keys written for one target and the checksum of each value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub checksums: BTreeMap<String, String>,
}

impl PublishReceipt {
    pub fn keys(&self) -> Vec<String> {
        self.checksums.keys().cloned().collect()
    }
}

/// Per-antenna gains from an `AIPS SN` table.
///
/// Single-polarization tables repeat the first gain for the second
/// polarization. Times go back to Unix seconds from the reference epoch.
pub fn calibration_solution(
    table: &EngineTable,
    target: &str,
    converged: bool,
    metadata: &ObservationMetadata,
) -> PipelineResult<CalibrationSolution> {
    let context = || ErrorContext::new("read_solutions").with_target(target);
    let mut by_antenna: BTreeMap<u32, Vec<GainSample>> = BTreeMap::new();
    for row in &table.rows {
        let column = |name: &str| {
            row_f64(row, name).ok_or_else(|| {
                PipelineError::format(format!("{} row without {}", SOLUTION_TABLE, name))
                    .with_context(context())
            })
        };
        let antenna = column("ANTENNA NO.")? as u32;
        let first = ComplexGain::new(column("REAL1")? as f32, column("IMAG1")? as f32);
        let second = match (row_f64(row, "REAL2"), row_f64(row, "IMAG2")) {
            (Some(re), Some(im)) => ComplexGain::new(re as f32, im as f32),
            _ => first,
        };
        by_antenna.entry(antenna).or_default().push(GainSample {
            time: time::from_day_offset(column("TIME")?, metadata.reference_epoch),
            gains: [first, second],
        });
    }

    let antennas = by_antenna
        .into_iter()
        .map(|(number, mut samples)| {
            samples.sort_by(|a, b| a.time.total_cmp(&b.time));
            let antenna = number
                .checked_sub(1)
                .and_then(|index| metadata.antennas.get(index as usize))
                .cloned()
                .unwrap_or_else(|| antenna_name(number));
            AntennaGains { antenna, samples }
        })
        .collect();
    Ok(CalibrationSolution {
        target: target.to_string(),
        converged,
        antennas,
    })
}

/// A clean component after merging coincident positions.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanComponent {
    /// Offsets from the reference position, degrees
    pub delta_x: f64,
    pub delta_y: f64,
    pub flux: f64,
    pub shape: ComponentShape,
    /// Tabulated per-plane fluxes, empty when not tabulated
    pub plane_fluxes: Vec<f64>,
}

fn component_shape(parms: &[f64]) -> ComponentShape {
    match parms {
        [major, minor, pa, kind, ..] if (*kind as i64) % 10 == 1 => ComponentShape::Gaussian {
            major_deg: *major,
            minor_deg: *minor,
            position_angle_deg: *pa,
        },
        _ => ComponentShape::Point,
    }
}

/// Merge components at identical positions and with identical shapes,
/// summing fluxes. Order of first appearance is kept.
pub fn merge_components(rows: &[TableRow]) -> PipelineResult<Vec<CleanComponent>> {
    let mut merged: Vec<CleanComponent> = Vec::new();
    let mut seen: HashMap<(u64, u64), Vec<usize>> = HashMap::new();

    for row in rows {
        let (Some(delta_x), Some(delta_y), Some(flux)) = (
            row_f64(row, "DELTAX"),
            row_f64(row, "DELTAY"),
            row_f64(row, "FLUX"),
        ) else {
            return Err(PipelineError::format(format!(
                "{} row without DELTAX, DELTAY or FLUX",
                CLEAN_TABLE
            ))
            .with_context(ErrorContext::new("merge_components")));
        };
        let parms = row_f64s(row, "PARMS");
        let shape = component_shape(&parms);
        let plane_fluxes = match parms.get(3) {
            Some(kind) if *kind >= TABULATED_TYPE => parms[4..].to_vec(),
            _ => Vec::new(),
        };

        let slots = seen.entry((delta_x.to_bits(), delta_y.to_bits())).or_default();
        match slots.iter().copied().find(|&i| merged[i].shape == shape) {
            Some(i) => {
                let existing = &mut merged[i];
                existing.flux += flux;
                if existing.plane_fluxes.len() < plane_fluxes.len() {
                    existing.plane_fluxes.resize(plane_fluxes.len(), 0.0);
                }
                for (total, f) in existing.plane_fluxes.iter_mut().zip(&plane_fluxes) {
                    *total += f;
                }
            }
            None => {
                slots.push(merged.len());
                merged.push(CleanComponent {
                    delta_x,
                    delta_y,
                    flux,
                    shape,
                    plane_fluxes,
                });
            }
        }
    }
    Ok(merged)
}

/// Inverse SIN projection of direction cosines `(l, m)` about
/// `(ra0, dec0)`. All angles in degrees; `None` outside the unit circle.
pub fn sin_to_radec(ra0: f64, dec0: f64, l: f64, m: f64) -> Option<(f64, f64)> {
    let (l, m) = (l.to_radians(), m.to_radians());
    let rho2 = l * l + m * m;
    if rho2 > 1.0 {
        return None;
    }
    let n = (1.0 - rho2).sqrt();
    let dec0 = dec0.to_radians();
    let dec = (m * dec0.cos() + n * dec0.sin()).asin();
    let ra = ra0.to_radians() + l.atan2(n * dec0.cos() - m * dec0.sin());
    Some((ra.to_degrees().rem_euclid(360.0), dec.to_degrees()))
}

/// Spectral index from a weighted least-squares line through
/// `ln S` against `ln(nu / nu0)`.
///
/// Planes with non-positive flux or rms are ignored; weights are
/// `(S / rms)^2`. Returns 0 when fewer than two planes remain or the
/// frequencies are degenerate.
pub fn spectral_index(freqs: &[f64], fluxes: &[f64], rms: &[f64], nu0: f64) -> f64 {
    let (mut sw, mut swx, mut swy, mut swxx, mut swxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    let mut points = 0;
    for (i, (&nu, &s)) in freqs.iter().zip(fluxes).enumerate() {
        let sigma = rms.get(i).copied().unwrap_or(1.0);
        if s <= 0.0 || sigma <= 0.0 || nu <= 0.0 {
            continue;
        }
        let x = (nu / nu0).ln();
        let y = s.ln();
        let w = (s / sigma).powi(2);
        sw += w;
        swx += w * x;
        swy += w * y;
        swxx += w * x * x;
        swxy += w * x * y;
        points += 1;
    }
    let denominator = sw * swxx - swx * swx;
    if points < 2 || denominator <= 1e-12 * sw * sw {
        return 0.0;
    }
    (sw * swxy - swx * swy) / denominator
}

/// Sky model from an `AIPS CC` table imaged around `target`.
pub fn sky_model(
    table: &EngineTable,
    target: &Target,
    reference_frequency: f64,
    converged: bool,
) -> PipelineResult<SkyModel> {
    let nu0 = table.keyword_f64("REFFREQ").unwrap_or(reference_frequency);
    let nspec = table.keyword_f64("NSPEC").unwrap_or(0.0) as usize;
    let freqs: Vec<f64> = (1..=nspec)
        .map(|i| table.keyword_f64(&format!("FREQ{:04}", i)).unwrap_or(0.0))
        .collect();
    let rms: Vec<f64> = (1..=nspec)
        .map(|i| table.keyword_f64(&format!("RMS{:04}", i)).unwrap_or(1.0))
        .collect();

    let mut components = Vec::new();
    for (i, cc) in merge_components(&table.rows)?.into_iter().enumerate() {
        let Some((ra_deg, dec_deg)) =
            sin_to_radec(target.ra_deg, target.dec_deg, cc.delta_x, cc.delta_y)
        else {
            warn!(
                "Dropping clean component {} of '{}': offset ({}, {}) outside projection",
                i, target.name, cc.delta_x, cc.delta_y
            );
            continue;
        };
        let spectral_index = if cc.plane_fluxes.is_empty() {
            0.0
        } else {
            spectral_index(&freqs, &cc.plane_fluxes, &rms, nu0)
        };
        components.push(SkyModelComponent {
            name: format!("CC_{:06}", i),
            ra_deg,
            dec_deg,
            flux: cc.flux,
            spectral_index,
            shape: cc.shape,
        });
    }
    Ok(SkyModel {
        target: target.name.clone(),
        reference_frequency: nu0,
        converged,
        components,
    })
}

/// Read both products of a finished target from its engine output.
///
/// A missing solution table yields an empty solution; a missing clean
/// component table is an error.
pub fn load_products(
    target: &Target,
    products: &SelfCalProducts,
    metadata: &ObservationMetadata,
) -> PipelineResult<(CalibrationSolution, SkyModel)> {
    let solution = match &products.solution_uv {
        Some(uv) if EngineTable::latest_version(uv, SOLUTION_TABLE).is_some() => {
            let table = EngineTable::read_latest(uv, SOLUTION_TABLE)?;
            calibration_solution(&table, &target.name, products.converged, metadata)?
        }
        _ => {
            warn!("No calibration solutions for '{}'", target.name);
            CalibrationSolution {
                target: target.name.clone(),
                converged: products.converged,
                antennas: Vec::new(),
            }
        }
    };
    let table = EngineTable::read_latest(&products.clean_image, CLEAN_TABLE)
        .map_err(|e| e.for_target(&target.name))?;
    let model = sky_model(&table, target, metadata.reference_frequency, products.converged)?;
    Ok((solution, model))
}

/// Writes products and failure records for one observation.
pub struct SolutionPublisher {
    store: Arc<dyn StateStore>,
    observation: String,
    failures: tokio::sync::Mutex<()>,
}

impl SolutionPublisher {
    pub fn new(store: Arc<dyn StateStore>, observation: impl Into<String>) -> Self {
        Self {
            store,
            observation: observation.into(),
            failures: tokio::sync::Mutex::new(()),
        }
    }

    pub fn observation(&self) -> &str {
        &self.observation
    }

    /// Write the solution and sky model of `target`, replacing earlier values,
    /// and clear any failure recorded for it.
    pub async fn publish(
        &self,
        target: &str,
        solution: &CalibrationSolution,
        model: &SkyModel,
    ) -> PipelineResult<PublishReceipt> {
        let mut receipt = PublishReceipt::default();
        for (name, value) in [
            (SOLUTIONS_KEY, serde_json::to_value(solution)?),
            (SKY_MODEL_KEY, serde_json::to_value(model)?),
        ] {
            let key = StateKey::target(&self.observation, target, name);
            let checksum = value_checksum(&value);
            self.put(&key, value).await?;
            receipt.checksums.insert(key.to_string(), checksum);
        }
        self.update_failures(|failures| {
            failures.remove(target);
        })
        .await?;
        info!(
            "Published {} antennas and {} components for '{}'",
            solution.antennas.len(),
            model.components.len(),
            target
        );
        Ok(receipt)
    }

    /// Record why `target` failed and remove anything published for it before.
    pub async fn publish_failure(&self, record: FailureRecord) -> PipelineResult<()> {
        let prefix = StateKey::target_prefix(&self.observation, &record.target);
        for stale in self.store.keys_with_prefix(&prefix).await? {
            if let Some(name) = stale.strip_prefix(&prefix) {
                let key = StateKey::target(&self.observation, &record.target, name);
                self.delete(&key).await?;
                warn!("Removed stale {}", key);
            }
        }
        let value = serde_json::to_value(&record)?;
        self.update_failures(|failures| {
            failures.insert(record.target.clone(), value);
        })
        .await
    }

    pub async fn failures(&self) -> PipelineResult<serde_json::Map<String, Value>> {
        let key = StateKey::observation(&self.observation, FAILURES_KEY);
        Ok(match self.store.get(&key).await? {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        })
    }

    async fn update_failures(
        &self,
        f: impl FnOnce(&mut serde_json::Map<String, Value>),
    ) -> PipelineResult<()> {
        let _guard = self.failures.lock().await;
        let key = StateKey::observation(&self.observation, FAILURES_KEY);
        let existing = self.store.get(&key).await?;
        let mut failures = match &existing {
            Some(Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        f(&mut failures);
        match (existing.is_some(), failures.is_empty()) {
            (false, true) => {}
            (true, true) => {
                self.delete(&key).await?;
            }
            _ => self.put(&key, Value::Object(failures)).await?,
        }
        Ok(())
    }

    async fn put(&self, key: &StateKey, value: Value) -> PipelineResult<()> {
        let store = &self.store;
        retry_store("put", key, move || store.put(key, value.clone())).await
    }

    async fn delete(&self, key: &StateKey) -> PipelineResult<bool> {
        let store = &self.store;
        retry_store("delete", key, move || store.delete(key)).await
    }
}

/// Run a store write, repeating it while the error says it may succeed.
async fn retry_store<T, F, Fut>(operation: &str, key: &StateKey, mut write: F) -> PipelineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 1;
    loop {
        match write().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < STORE_ATTEMPTS => {
                warn!(
                    "State store {} of {} failed (attempt {}/{}): {}",
                    operation, key, attempt, STORE_ATTEMPTS, e
                );
                tokio::time::sleep(STORE_RETRY_DELAY * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

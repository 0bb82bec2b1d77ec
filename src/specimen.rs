//! Per-specimen record store.
//!
//! A specimen file holds a summary record (the step count), the sample
//! information record, and one [`SpecimenRecord`] per completed measurement
//! step, addressed by [`RecordKey`]. The in-memory copy is the working
//! ("focus") copy; [`SpecimenFile::flush`] writes it out as JSON.
//!
//! Steps are reserved with [`SpecimenFile::begin_step`] before a measurement
//! starts and either committed with the reduced record or rolled back if the
//! step is cancelled, so the stored step count only ever grows by completed
//! steps.

use crate::error::{AppResult, DaqError};
use crate::reduction::{Direction, Reduction};
use crate::measurement::Vec3;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Sample information record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleInfo {
    /// Specimen name
    pub name: String,
    /// Volume or mass used to compute magnetization
    pub size: f64,
    /// Core azimuth (degrees)
    pub core_azimuth: f64,
    /// Core plunge (degrees, down positive)
    pub core_plunge: f64,
    /// Bedding dip direction (degrees)
    pub bedding_dip_direction: f64,
    /// Bedding dip (degrees)
    pub bedding_dip: f64,
    /// Bedding is overturned
    pub overturned: bool,
    /// Fold hinge azimuth (degrees)
    pub fold_hinge_azimuth: f64,
    /// Fold hinge plunge (degrees)
    pub fold_plunge: f64,
}

impl Default for SampleInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            size: 1.0,
            core_azimuth: 0.0,
            core_plunge: 0.0,
            bedding_dip_direction: 0.0,
            bedding_dip: 0.0,
            overturned: false,
            fold_hinge_azimuth: 0.0,
            fold_plunge: 0.0,
        }
    }
}

impl SampleInfo {
    /// Sample information with only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// One reduced measurement step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecimenRecord {
    /// Step index, starting at 1
    pub step: u32,
    /// AF level in mT (0 for NRM)
    pub level_mt: f64,
    /// Core-frame direction
    pub core: Direction,
    /// Geographic direction
    pub in_situ: Direction,
    /// Tilt-corrected direction
    pub stratigraphic: Direction,
    /// Total moment (emu)
    pub total_moment: f64,
    /// Magnetization
    pub magnetization: f64,
    /// Mean moment per sample axis (emu)
    pub moment: Vec3,
    /// Standard deviation per sample axis (emu)
    pub sigma: Vec3,
    /// Readings per sample axis
    pub count: [u32; 3],
    /// Percent error per sample axis
    pub percent_error: Vec3,
    /// Signal to noise
    pub signal_to_noise: f64,
    /// Signal to drift
    pub signal_to_drift: f64,
    /// Signal to holder
    pub signal_to_holder: f64,
    /// When the step was measured
    pub timestamp: DateTime<Utc>,
}

impl SpecimenRecord {
    /// Build the record for `step` from a reduction.
    pub fn from_reduction(step: u32, level_mt: f64, reduction: &Reduction) -> Self {
        Self {
            step,
            level_mt,
            core: reduction.core,
            in_situ: reduction.in_situ,
            stratigraphic: reduction.stratigraphic,
            total_moment: reduction.total_moment,
            magnetization: reduction.magnetization,
            moment: reduction.statistics.mean,
            sigma: reduction.statistics.sigma,
            count: reduction.statistics.count,
            percent_error: reduction.percent_error,
            signal_to_noise: reduction.signal_to_noise,
            signal_to_drift: reduction.signal_to_drift,
            signal_to_holder: reduction.signal_to_holder,
            timestamp: Utc::now(),
        }
    }
}

/// Record identifiers within a specimen file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKey {
    /// `-1`: summary (step count)
    Summary,
    /// `0`: sample information
    Info,
    /// `1..=N`: measurement steps
    Step(u32),
}

impl RecordKey {
    /// Numeric identifier.
    pub fn id(self) -> i64 {
        match self {
            RecordKey::Summary => -1,
            RecordKey::Info => 0,
            RecordKey::Step(n) => i64::from(n),
        }
    }

    /// Key for a numeric identifier.
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            -1 => Some(RecordKey::Summary),
            0 => Some(RecordKey::Info),
            n if n > 0 => u32::try_from(n).ok().map(RecordKey::Step),
            _ => None,
        }
    }
}

/// A record copied out of the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Number of completed steps
    Summary {
        /// Step count
        steps: u32,
    },
    /// Sample information
    Info(SampleInfo),
    /// One measurement step
    Step(SpecimenRecord),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSpecimen {
    steps: u32,
    info: SampleInfo,
    records: Vec<SpecimenRecord>,
}

/// Specimen record store.
#[derive(Debug)]
pub struct SpecimenFile {
    path: PathBuf,
    info: SampleInfo,
    records: Vec<SpecimenRecord>,
    pending: Option<u32>,
    dirty: bool,
}

impl SpecimenFile {
    /// File path for `specimen` under `data_dir`.
    ///
    /// The name must be a single plain file name: empty names, `.`, `..`
    /// and names holding a path separator are rejected.
    pub fn path_for(data_dir: &Path, specimen: &str) -> AppResult<PathBuf> {
        let name = specimen.trim();
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\', '\0'])
        {
            return Err(DaqError::Store(format!("invalid specimen name {specimen:?}")));
        }
        Ok(data_dir.join(format!("{name}.json")))
    }

    /// New, empty store at `path`. Nothing is written until [`flush`](Self::flush).
    pub fn create(path: impl Into<PathBuf>, info: SampleInfo) -> Self {
        Self {
            path: path.into(),
            info,
            records: Vec::new(),
            pending: None,
            dirty: true,
        }
    }

    /// Load an existing store.
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)?;
        let stored: StoredSpecimen = serde_json::from_str(&text)?;
        if stored.steps as usize != stored.records.len() {
            return Err(DaqError::Store(format!(
                "{}: summary says {} steps but {} records are present",
                path.display(),
                stored.steps,
                stored.records.len()
            )));
        }
        Ok(Self {
            path,
            info: stored.info,
            records: stored.records,
            pending: None,
            dirty: false,
        })
    }

    /// Load the store at `path`, or create it with `info` if it does not exist.
    pub fn open_or_create(path: impl Into<PathBuf>, info: SampleInfo) -> AppResult<Self> {
        let path = path.into();
        if path.exists() {
            Self::open(path)
        } else {
            Ok(Self::create(path, info))
        }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sample information.
    pub fn info(&self) -> &SampleInfo {
        &self.info
    }

    /// Completed steps.
    pub fn step_count(&self) -> u32 {
        self.records.len() as u32
    }

    /// Completed step records in order.
    pub fn records(&self) -> &[SpecimenRecord] {
        &self.records
    }

    /// Copy a record by key.
    pub fn get(&self, key: RecordKey) -> Option<Record> {
        match key {
            RecordKey::Summary => Some(Record::Summary {
                steps: self.step_count(),
            }),
            RecordKey::Info => Some(Record::Info(self.info.clone())),
            RecordKey::Step(0) => None,
            RecordKey::Step(n) => self.records.get(n as usize - 1).cloned().map(Record::Step),
        }
    }

    /// Replace the sample information.
    pub fn set_info(&mut self, info: SampleInfo) {
        self.info = info;
        self.dirty = true;
    }

    /// Reserve the next step index.
    pub fn begin_step(&mut self) -> AppResult<u32> {
        if let Some(step) = self.pending {
            return Err(DaqError::Store(format!("step {step} is still in progress")));
        }
        let step = self.step_count() + 1;
        self.pending = Some(step);
        Ok(step)
    }

    /// Store the record for the reserved step.
    pub fn commit(&mut self, record: SpecimenRecord) -> AppResult<()> {
        match self.pending {
            Some(step) if step == record.step => {
                self.records.push(record);
                self.pending = None;
                self.dirty = true;
                Ok(())
            }
            Some(step) => Err(DaqError::Store(format!(
                "record for step {} does not match reserved step {step}",
                record.step
            ))),
            None => Err(DaqError::Store("no step reserved".into())),
        }
    }

    /// Discard the reserved step.
    pub fn rollback(&mut self) {
        if let Some(step) = self.pending.take() {
            tracing::info!(specimen = %self.info.name, step, "Rolled back step");
        }
    }

    /// Whether a step is reserved.
    pub fn has_pending_step(&self) -> bool {
        self.pending.is_some()
    }

    /// Write the working copy if it changed.
    pub fn flush(&mut self) -> AppResult<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let stored = StoredSpecimen {
            steps: self.step_count(),
            info: self.info.clone(),
            records: self.records.clone(),
        };
        let text = serde_json::to_string_pretty(&stored)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        tracing::debug!(path = %self.path.display(), steps = stored.steps, "Specimen file flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduction::NormalStatistics;
    use tempfile::TempDir;

    fn record(step: u32) -> SpecimenRecord {
        let reduction = Reduction {
            statistics: NormalStatistics::default(),
            percent_error: Vec3::ZERO,
            total_moment: 1.0,
            magnetization: 1.0,
            core: Direction::default(),
            in_situ: Direction::default(),
            stratigraphic: Direction::default(),
            signal_to_noise: 100.0,
            signal_to_drift: 100.0,
            signal_to_holder: 100.0,
        };
        SpecimenRecord::from_reduction(step, 5.0, &reduction)
    }

    #[test]
    fn record_keys_map_to_ids() {
        assert_eq!(RecordKey::Summary.id(), -1);
        assert_eq!(RecordKey::from_id(0), Some(RecordKey::Info));
        assert_eq!(RecordKey::from_id(3), Some(RecordKey::Step(3)));
        assert_eq!(RecordKey::from_id(-2), None);
    }

    #[test]
    fn steps_commit_and_roll_back() {
        let mut file = SpecimenFile::create("unused.json", SampleInfo::named("S1"));
        let step = file.begin_step().unwrap();
        assert_eq!(step, 1);
        assert!(file.begin_step().is_err());
        file.commit(record(step)).unwrap();

        let step = file.begin_step().unwrap();
        assert_eq!(step, 2);
        file.rollback();
        assert_eq!(file.step_count(), 1);
        assert_eq!(file.begin_step().unwrap(), 2);
        assert!(file.commit(record(7)).is_err());
    }

    #[test]
    fn specimen_names_stay_inside_the_data_dir() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            SpecimenFile::path_for(dir.path(), "BH-12a").unwrap(),
            dir.path().join("BH-12a.json")
        );
        for name in ["../escape", "a/b", "..", "", "  ", "c:\\x"] {
            assert!(
                matches!(SpecimenFile::path_for(dir.path(), name), Err(DaqError::Store(_))),
                "{name:?} accepted"
            );
        }
    }

    #[test]
    fn flush_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = SpecimenFile::path_for(dir.path(), "S1").unwrap();
        let mut file = SpecimenFile::create(&path, SampleInfo::named("S1"));
        let step = file.begin_step().unwrap();
        file.commit(record(step)).unwrap();
        file.flush().unwrap();

        let reopened = SpecimenFile::open(&path).unwrap();
        assert_eq!(reopened.step_count(), 1);
        assert_eq!(reopened.info().name, "S1");
        assert_eq!(reopened.get(RecordKey::Summary), Some(Record::Summary { steps: 1 }));
        match reopened.get(RecordKey::Step(1)) {
            Some(Record::Step(r)) => assert_eq!(r.level_mt, 5.0),
            other => panic!("unexpected {other:?}"),
        }
        assert!(reopened.get(RecordKey::Step(2)).is_none());
    }
}

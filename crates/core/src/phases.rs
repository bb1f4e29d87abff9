//! Phase-marker progress estimation.
//!
//! Each execution unit may carry an ordered [`PhaseTable`]: log markers with
//! the cumulative progress reached when the marker is first seen. The
//! [`ProgressEstimator`] folds backend signals into a [`ProgressState`] that
//! never moves backwards.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::status::JobStatus;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Ceiling for the elapsed-time heuristic; only a terminal signal reaches 100.
pub const TIME_HEURISTIC_CAP: u8 = 95;

/// Phase label reported once a job completes.
pub const COMPLETED_LABEL: &str = "Completed";

type Milestone = (&'static str, u8, &'static str);

const FREESURFER_RECON: &[Milestone] = &[
    ("recon-all", 2, "Initializing recon-all"),
    ("SUBJECTS_DIR", 3, "Setting up subject directory"),
    ("MotionCorrect", 5, "Motion correction"),
    ("mri_convert", 6, "Converting input format"),
    ("Talairach", 8, "Talairach registration"),
    ("NUIntensityCorrection", 10, "Intensity correction (N3)"),
    ("SkullStripping", 14, "Skull stripping"),
    ("EMRegister", 18, "EM registration"),
    ("CANormalize", 20, "CA normalize"),
    ("CARegister", 25, "CA register (atlas)"),
    ("SubCortSeg", 30, "Subcortical segmentation"),
    ("IntensityNormalization2", 33, "Intensity normalization 2"),
    ("WhiteMatterSegmentation", 36, "White matter segmentation"),
    ("Fill", 38, "Filling ventricles"),
    ("Tessellate", 42, "Tessellating hemispheres"),
    ("Smooth1", 45, "Smoothing surface 1"),
    ("Inflation1", 48, "Inflating surface 1"),
    ("QSphere", 52, "Quasi-sphere mapping"),
    ("FixTopology", 56, "Fixing topology"),
    ("MakeWhiteSurface", 60, "Generating white surface"),
    ("Smooth2", 63, "Smoothing surface 2"),
    ("Inflation2", 65, "Inflating surface 2"),
    ("SphericalMapping", 68, "Spherical mapping"),
    ("IpsilateralSurfaceReg", 72, "Surface registration"),
    ("CorticalParcellation", 75, "Cortical parcellation (Desikan)"),
    ("PialSurface", 78, "Generating pial surface"),
    ("CorticalParcellation2", 82, "Cortical parcellation (DKT)"),
    ("CorticalRibbon", 85, "Cortical ribbon mask"),
    ("CorticalThickness", 88, "Computing cortical thickness"),
    ("ParcellationStats", 91, "Parcellation statistics"),
    ("CorticalParcellation3", 93, "Cortical parcellation (BA)"),
    ("WM/GMContrast", 95, "WM/GM contrast"),
    ("recon-all.*finished", 97, "recon-all finished"),
    ("FreeSurfer recon-all completed", 100, COMPLETED_LABEL),
];

const FASTSURFER: &[Milestone] = &[
    ("run_fastsurfer", 2, "Starting FastSurfer"),
    ("SUBJECTS_DIR", 3, "Setting up directories"),
    ("Running FastSurferCNN", 5, "Loading segmentation model"),
    ("Loading checkpoint", 8, "Loading model checkpoint"),
    ("Evaluating", 12, "Running CNN segmentation"),
    ("sagittal", 18, "Segmenting sagittal plane"),
    ("coronal", 24, "Segmenting coronal plane"),
    ("axial", 30, "Segmenting axial plane"),
    ("ViewAggregation", 35, "Aggregating views"),
    ("recon-surf", 38, "Starting surface recon"),
    ("mri_convert", 40, "Converting volumes"),
    ("mris_inflate", 50, "Inflating surfaces"),
    ("mris_sphere", 58, "Spherical mapping"),
    ("mris_register", 65, "Surface registration"),
    ("mris_ca_label", 72, "Cortical parcellation"),
    ("mris_anatomical_stats", 80, "Anatomical statistics"),
    ("mri_aparc2aseg", 85, "aparc+aseg creation"),
    ("aseg.stats", 90, "Writing statistics"),
    ("Metrics extracted", 95, "Extracting metrics"),
    ("FastSurfer completed", 100, COMPLETED_LABEL),
];

const FMRIPREP: &[Milestone] = &[
    ("fMRIPrep", 2, "Initializing fMRIPrep"),
    ("Anatomical processing", 8, "Anatomical preprocessing"),
    ("Brain extraction", 15, "Brain extraction"),
    ("Tissue segmentation", 22, "Tissue segmentation"),
    ("Surface reconstruction", 35, "Surface reconstruction"),
    ("BOLD processing", 50, "BOLD preprocessing"),
    ("Slice-timing correction", 55, "Slice-timing correction"),
    ("Head-motion estimation", 60, "Head-motion estimation"),
    ("Susceptibility distortion", 65, "Susceptibility distortion correction"),
    ("Registration", 72, "Registration to standard"),
    ("Confound estimation", 82, "Confound estimation"),
    ("BOLD resampling", 90, "BOLD resampling"),
    ("Generating report", 95, "Generating report"),
    ("fMRIPrep finished", 100, COMPLETED_LABEL),
];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A phase as written in a definition file: marker plus relative weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDecl {
    pub marker: String,
    pub weight: u8,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct PhaseMarker {
    pattern: Regex,
    /// Cumulative progress once this marker has been seen.
    pub progress: u8,
    pub label: String,
}

impl PhaseMarker {
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

/// Ordered phase markers with non-decreasing cumulative progress.
#[derive(Debug, Clone)]
pub struct PhaseTable {
    markers: Vec<PhaseMarker>,
}

impl PhaseTable {
    /// Build from cumulative `(marker, progress, label)` entries.
    pub fn from_cumulative<'a, I>(entries: I) -> Result<Self, CoreError>
    where
        I: IntoIterator<Item = (&'a str, u8, &'a str)>,
    {
        let mut markers: Vec<PhaseMarker> = Vec::new();
        for (marker, progress, label) in entries {
            if progress > 100 {
                return Err(CoreError::Validation(format!(
                    "Phase '{label}' progress {progress} exceeds 100"
                )));
            }
            if let Some(prev) = markers.last() {
                if progress < prev.progress {
                    return Err(CoreError::Validation(format!(
                        "Phase '{label}' progress {progress} is lower than the previous phase"
                    )));
                }
            }
            let pattern = Regex::new(marker).map_err(|e| {
                CoreError::Validation(format!("Invalid phase marker '{marker}': {e}"))
            })?;
            markers.push(PhaseMarker {
                pattern,
                progress,
                label: label.to_string(),
            });
        }
        if markers.is_empty() {
            return Err(CoreError::Validation("Phase table is empty".into()));
        }
        Ok(Self { markers })
    }

    /// Build from per-phase weights, which must sum to exactly 100.
    pub fn from_weights(phases: &[PhaseDecl]) -> Result<Self, CoreError> {
        let total: u32 = phases.iter().map(|p| u32::from(p.weight)).sum();
        if total != 100 {
            return Err(CoreError::Validation(format!(
                "Phase weights must sum to 100 (got {total})"
            )));
        }
        let mut cumulative: u8 = 0;
        let entries: Vec<(&str, u8, &str)> = phases
            .iter()
            .map(|p| {
                cumulative += p.weight;
                (p.marker.as_str(), cumulative, p.label.as_str())
            })
            .collect();
        Self::from_cumulative(entries)
    }

    /// Built-in table for well-known pipelines.
    pub fn builtin(plugin_id: &str) -> Option<Self> {
        let table = match plugin_id {
            "freesurfer_recon" | "freesurfer_recon_long" => FREESURFER_RECON,
            "fastsurfer" | "fastsurfer_seg" => FASTSURFER,
            "fmriprep" => FMRIPREP,
            _ => return None,
        };
        Self::from_cumulative(table.iter().copied()).ok()
    }

    /// Chain per-step tables into one, scaling each into its step's share
    /// of the whole. Steps without a table contribute no markers.
    pub fn sequential(steps: &[Option<PhaseTable>]) -> Option<Self> {
        let n = steps.len();
        let markers: Vec<PhaseMarker> = steps
            .iter()
            .enumerate()
            .filter_map(|(i, table)| table.as_ref().map(|t| (i, t)))
            .flat_map(|(i, table)| {
                table.markers.iter().map(move |m| PhaseMarker {
                    pattern: m.pattern.clone(),
                    progress: combine_step_progress(i, n, m.progress),
                    label: m.label.clone(),
                })
            })
            .collect();
        (!markers.is_empty()).then_some(Self { markers })
    }

    pub fn markers(&self) -> &[PhaseMarker] {
        &self.markers
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

/// Progress snapshot carried between observations of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    pub progress: u8,
    pub phase: Option<String>,
    /// Index of the furthest marker recognised so far.
    #[serde(default)]
    pub marker_index: Option<usize>,
}

impl ProgressState {
    /// Resume from persisted values.
    pub fn resume(progress: u8, phase: Option<String>) -> Self {
        Self {
            progress: progress.min(100),
            phase,
            marker_index: None,
        }
    }
}

/// A backend-observable signal.
#[derive(Debug, Clone, Copy)]
pub enum BackendSignal<'a> {
    /// A chunk of log output (typically the tail of the container log).
    Log(&'a str),
    /// Wall-clock time since start against the declared limit.
    Elapsed {
        elapsed: Duration,
        time_limit_hours: f64,
    },
    /// The job reached this status.
    Terminal(JobStatus),
}

/// Maps backend signals onto a monotonic 0..=100 progress value.
#[derive(Debug, Clone, Default)]
pub struct ProgressEstimator {
    table: Option<PhaseTable>,
}

impl ProgressEstimator {
    pub fn new(table: Option<PhaseTable>) -> Self {
        Self { table }
    }

    pub fn has_markers(&self) -> bool {
        self.table.is_some()
    }

    /// Fold `signal` into `state`. Returns `true` when the state changed.
    pub fn estimate(&self, state: &mut ProgressState, signal: BackendSignal<'_>) -> bool {
        let before = state.clone();
        match signal {
            BackendSignal::Log(text) => self.apply_log(state, text),
            BackendSignal::Elapsed {
                elapsed,
                time_limit_hours,
            } => {
                // Markers are authoritative once any has been seen.
                if state.marker_index.is_none() && state.phase.is_none() {
                    let pct = elapsed_percent(elapsed, time_limit_hours);
                    state.progress = state.progress.max(pct);
                }
            }
            BackendSignal::Terminal(JobStatus::Completed) => {
                state.progress = 100;
                state.phase = Some(COMPLETED_LABEL.to_string());
            }
            BackendSignal::Terminal(_) => {}
        }
        *state != before
    }

    fn apply_log(&self, state: &mut ProgressState, text: &str) {
        let Some(table) = &self.table else {
            return;
        };
        let start = state.marker_index.map_or(0, |i| i + 1);
        let furthest = table.markers[start.min(table.markers.len())..]
            .iter()
            .enumerate()
            .filter(|(_, m)| m.pattern.is_match(text))
            .map(|(offset, _)| start + offset)
            .last();
        if let Some(idx) = furthest {
            let marker = &table.markers[idx];
            state.marker_index = Some(idx);
            if marker.progress >= state.progress {
                state.progress = marker.progress;
                state.phase = Some(marker.label.clone());
            }
        }
    }
}

/// Elapsed-time fraction of the declared limit, capped below 100.
pub fn elapsed_percent(elapsed: Duration, time_limit_hours: f64) -> u8 {
    if !(time_limit_hours.is_finite() && time_limit_hours > 0.0) {
        return 0;
    }
    let fraction = elapsed.as_secs_f64() / (time_limit_hours * 3600.0);
    let pct = (fraction * 100.0).floor();
    if pct >= f64::from(TIME_HEURISTIC_CAP) {
        TIME_HEURISTIC_CAP
    } else if pct <= 0.0 {
        0
    } else {
        pct as u8
    }
}

/// Overall progress of a multi-step job given the progress of its current step.
pub fn combine_step_progress(step_index: usize, step_count: usize, step_progress: u8) -> u8 {
    if step_count == 0 {
        return step_progress.min(100);
    }
    let done = step_index.min(step_count) as f64 * 100.0;
    let total = (done + f64::from(step_progress.min(100))) / step_count as f64;
    total.floor().min(100.0) as u8
}

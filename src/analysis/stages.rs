//! Stage bookkeeping for the analysis pipeline
//!
//! Each stage owns a fixed, disjoint slice of overall progress. Stages move
//! Pending -> Active -> Completed exactly once per run, in order.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{CapflowError, Result};

/// The four ordered pipeline phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStage {
    Counting,
    Loading,
    Statistics,
    Finalizing,
}

impl AnalysisStage {
    pub const ALL: [AnalysisStage; 4] = [
        AnalysisStage::Counting,
        AnalysisStage::Loading,
        AnalysisStage::Statistics,
        AnalysisStage::Finalizing,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AnalysisStage::Counting => "counting",
            AnalysisStage::Loading => "loading",
            AnalysisStage::Statistics => "statistics",
            AnalysisStage::Finalizing => "finalizing",
        }
    }

    /// Slice of overall progress owned by this stage, as (start, end) percent
    pub fn progress_range(&self) -> (f64, f64) {
        match self {
            AnalysisStage::Counting => (0.0, 10.0),
            AnalysisStage::Loading => (10.0, 70.0),
            AnalysisStage::Statistics => (70.0, 90.0),
            AnalysisStage::Finalizing => (90.0, 100.0),
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Active,
    Completed,
}

/// Timing and status of one stage, as reported to consumers
#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: AnalysisStage,
    pub status: StageStatus,
    /// Intra-stage percent, 0-100
    pub percent: f64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
struct StageState {
    status: StageStatus,
    percent: f64,
    started: Option<Instant>,
    elapsed: Duration,
}

impl Default for StageState {
    fn default() -> Self {
        Self { status: StageStatus::Pending, percent: 0.0, started: None, elapsed: Duration::ZERO }
    }
}

/// Tracks stage transitions for one run
#[derive(Debug, Clone, Default)]
pub struct StageTracker {
    stages: [StageState; 4],
}

impl StageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate `stage`. Every earlier stage must already be completed and
    /// a stage is never re-activated.
    pub fn activate(&mut self, stage: AnalysisStage) -> Result<()> {
        let idx = stage.index();
        if let Some(pending) = self.stages[..idx].iter().position(|s| s.status != StageStatus::Completed) {
            return Err(CapflowError::stage(
                stage.name(),
                format!("cannot start before '{}' completes", AnalysisStage::ALL[pending].name()),
            ));
        }
        let state = &mut self.stages[idx];
        if state.status != StageStatus::Pending {
            return Err(CapflowError::stage(stage.name(), "stage already started"));
        }
        state.status = StageStatus::Active;
        state.started = Some(Instant::now());
        Ok(())
    }

    /// Update intra-stage progress. Only moves forward, and only while active.
    pub fn set_percent(&mut self, stage: AnalysisStage, percent: f64) {
        let state = &mut self.stages[stage.index()];
        if state.status == StageStatus::Active {
            state.percent = state.percent.max(percent.clamp(0.0, 100.0));
        }
    }

    pub fn complete(&mut self, stage: AnalysisStage) -> Result<()> {
        let state = &mut self.stages[stage.index()];
        if state.status != StageStatus::Active {
            return Err(CapflowError::stage(stage.name(), "stage is not active"));
        }
        state.status = StageStatus::Completed;
        state.percent = 100.0;
        state.elapsed = state.started.map(|t| t.elapsed()).unwrap_or_default();
        Ok(())
    }

    pub fn status(&self, stage: AnalysisStage) -> StageStatus {
        self.stages[stage.index()].status
    }

    pub fn percent(&self, stage: AnalysisStage) -> f64 {
        self.stages[stage.index()].percent
    }

    /// Elapsed time of a stage; live while it is active
    pub fn elapsed(&self, stage: AnalysisStage) -> Duration {
        let state = &self.stages[stage.index()];
        match (state.status, state.started) {
            (StageStatus::Active, Some(started)) => started.elapsed(),
            _ => state.elapsed,
        }
    }

    /// Overall percent across every stage
    pub fn overall_percent(&self) -> f64 {
        AnalysisStage::ALL
            .iter()
            .map(|stage| {
                let (start, end) = stage.progress_range();
                (end - start) * self.percent(*stage) / 100.0
            })
            .sum()
    }

    pub fn timings(&self) -> Vec<StageTiming> {
        AnalysisStage::ALL
            .iter()
            .map(|stage| StageTiming {
                stage: *stage,
                status: self.status(*stage),
                percent: self.percent(*stage),
                elapsed_ms: self.elapsed(*stage).as_millis() as u64,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_transitions() {
        let mut tracker = StageTracker::new();
        assert!(tracker.activate(AnalysisStage::Loading).is_err());

        tracker.activate(AnalysisStage::Counting).unwrap();
        assert_eq!(tracker.status(AnalysisStage::Counting), StageStatus::Active);
        tracker.complete(AnalysisStage::Counting).unwrap();

        // never re-activated
        assert!(tracker.activate(AnalysisStage::Counting).is_err());
        assert!(tracker.complete(AnalysisStage::Counting).is_err());

        tracker.activate(AnalysisStage::Loading).unwrap();
        assert_eq!(tracker.status(AnalysisStage::Counting), StageStatus::Completed);
        assert_eq!(tracker.status(AnalysisStage::Statistics), StageStatus::Pending);
    }

    #[test]
    fn test_percent_is_monotonic_and_scoped() {
        let mut tracker = StageTracker::new();
        tracker.set_percent(AnalysisStage::Counting, 50.0);
        assert_eq!(tracker.percent(AnalysisStage::Counting), 0.0);

        tracker.activate(AnalysisStage::Counting).unwrap();
        tracker.set_percent(AnalysisStage::Counting, 60.0);
        tracker.set_percent(AnalysisStage::Counting, 40.0);
        assert_eq!(tracker.percent(AnalysisStage::Counting), 60.0);
        assert!((tracker.overall_percent() - 6.0).abs() < 1e-9);

        tracker.complete(AnalysisStage::Counting).unwrap();
        tracker.activate(AnalysisStage::Loading).unwrap();
        tracker.set_percent(AnalysisStage::Loading, 50.0);
        assert!((tracker.overall_percent() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_ranges_are_disjoint_and_cover_everything() {
        let mut expected_start = 0.0;
        for stage in AnalysisStage::ALL {
            let (start, end) = stage.progress_range();
            assert_eq!(start, expected_start);
            assert!(end > start);
            expected_start = end;
        }
        assert_eq!(expected_start, 100.0);
    }

    #[test]
    fn test_timings_report_every_stage() {
        let mut tracker = StageTracker::new();
        for stage in AnalysisStage::ALL {
            tracker.activate(stage).unwrap();
            tracker.complete(stage).unwrap();
        }
        let timings = tracker.timings();
        assert_eq!(timings.len(), 4);
        assert!(timings.iter().all(|t| t.status == StageStatus::Completed && t.percent == 100.0));
        assert_eq!(tracker.overall_percent(), 100.0);
    }
}

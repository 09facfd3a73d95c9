//! Per-unit phase progress and the unlock rules.
//!
//! Everything lives under one storage key as a JSON map of unit id to
//! [`UnitProgress`]. Each mutation is a read-modify-write of that record;
//! concurrent writers race and the last write wins.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use coach_core::curriculum::{CurriculumPhase, CurriculumUnit};
use coach_core::KeyValueStore;

use crate::error::{EngineError, Result};

pub const PROGRESS_KEY: &str = "unit-progress";

/// The checkpoint whose checklist gates [`GATED_PHASE`].
pub const CHECKPOINT_PHASE: &str = "part1_checkpoint";
pub const GATED_PHASE: &str = "part2_work";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseProgress {
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checklist: Vec<bool>,
}

impl PhaseProgress {
    pub fn checked_count(&self) -> usize {
        self.checklist.iter().filter(|c| **c).count()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitProgress {
    #[serde(default, alias = "currentPhase")]
    pub current_phase_index: usize,
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseProgress>,
}

impl UnitProgress {
    pub fn phase(&self, phase_id: &str) -> Option<&PhaseProgress> {
        self.phases.get(phase_id)
    }

    pub fn is_completed(&self, phase_id: &str) -> bool {
        self.phase(phase_id).is_some_and(|p| p.completed)
    }

    fn phase_mut(&mut self, phase_id: &str) -> &mut PhaseProgress {
        self.phases.entry(phase_id.to_string()).or_default()
    }
}

type ProgressMap = BTreeMap<String, UnitProgress>;

/// Checked items needed to pass a checklist of `item_count`: half, rounded up.
pub fn checklist_threshold(item_count: usize) -> usize {
    item_count.div_ceil(2)
}

/// Which phases may be entered. Phase 0 is always open. The gated phase needs
/// the checkpoint completed and, when the checkpoint has a checklist, enough
/// items checked. Every other phase needs its predecessor completed.
pub fn compute_unlocked(phases: &[CurriculumPhase], progress: &UnitProgress) -> Vec<bool> {
    phases
        .iter()
        .enumerate()
        .map(|(index, phase)| {
            if index == 0 {
                return true;
            }
            if phase.id == GATED_PHASE {
                return checkpoint_passed(phases, progress);
            }
            progress.is_completed(&phases[index - 1].id)
        })
        .collect()
}

fn checkpoint_passed(phases: &[CurriculumPhase], progress: &UnitProgress) -> bool {
    let Some(state) = progress.phase(CHECKPOINT_PHASE).filter(|p| p.completed) else {
        return false;
    };
    match phases.iter().find(|p| p.id == CHECKPOINT_PHASE) {
        Some(checkpoint) if checkpoint.has_checklist() => {
            state.checked_count() >= checklist_threshold(checkpoint.checklist.len())
        }
        _ => true,
    }
}

#[derive(Clone)]
pub struct ProgressStore {
    store: Arc<dyn KeyValueStore>,
}

impl ProgressStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Unreadable records are treated as empty rather than failing every
    /// later call.
    fn load(&self) -> Result<ProgressMap> {
        let Some(raw) = self.store.get(PROGRESS_KEY)? else {
            return Ok(ProgressMap::new());
        };
        match serde_json::from_str(&raw) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!(error = %e, "discarding unreadable progress record");
                Ok(ProgressMap::new())
            }
        }
    }

    fn save(&self, map: &ProgressMap) -> Result<()> {
        self.store.set(PROGRESS_KEY, &serde_json::to_string(map)?)?;
        Ok(())
    }

    fn update<R>(&self, unit_id: &str, f: impl FnOnce(&mut UnitProgress) -> R) -> Result<R> {
        let mut map = self.load()?;
        let out = f(map.entry(unit_id.to_string()).or_default());
        self.save(&map)?;
        Ok(out)
    }

    pub fn unit_progress(&self, unit_id: &str) -> Result<UnitProgress> {
        Ok(self.load()?.remove(unit_id).unwrap_or_default())
    }

    pub fn has_progress(&self, unit_id: &str) -> Result<bool> {
        Ok(self.load()?.contains_key(unit_id))
    }

    pub fn complete_phase(&self, unit_id: &str, phase_id: &str) -> Result<()> {
        self.update(unit_id, |unit| unit.phase_mut(phase_id).completed = true)?;
        debug!(unit_id, phase_id, "phase completed");
        Ok(())
    }

    pub fn is_phase_completed(&self, unit_id: &str, phase_id: &str) -> Result<bool> {
        Ok(self.unit_progress(unit_id)?.is_completed(phase_id))
    }

    /// Completed phases cover at least `phase_count`.
    pub fn is_unit_completed(&self, unit_id: &str, phase_count: usize) -> Result<bool> {
        let Some(unit) = self.load()?.remove(unit_id) else {
            return Ok(false);
        };
        Ok(unit.phases.values().filter(|p| p.completed).count() >= phase_count)
    }

    pub fn set_current_phase(&self, unit: &CurriculumUnit, index: usize) -> Result<()> {
        validate_index(unit, index)?;
        self.update(&unit.id, |progress| progress.current_phase_index = index)
    }

    /// Stored resume pointer, clamped to the unit's phases.
    pub fn resume_phase_index(&self, unit: &CurriculumUnit) -> Result<usize> {
        let stored = self.unit_progress(&unit.id)?.current_phase_index;
        Ok(stored.min(unit.phases.len().saturating_sub(1)))
    }

    pub fn checklist(&self, unit_id: &str, phase_id: &str) -> Result<Vec<bool>> {
        Ok(self
            .unit_progress(unit_id)?
            .phases
            .remove(phase_id)
            .map(|p| p.checklist)
            .unwrap_or_default())
    }

    /// Replace the checked flags for a phase. A shorter array is padded with
    /// `false` to the stored length; the stored array never shrinks.
    pub fn set_checklist(
        &self,
        unit_id: &str,
        phase_id: &str,
        mut checked: Vec<bool>,
    ) -> Result<()> {
        self.update(unit_id, |unit| {
            let phase = unit.phase_mut(phase_id);
            if checked.len() < phase.checklist.len() {
                checked.resize(phase.checklist.len(), false);
            }
            phase.checklist = checked;
        })
    }

    /// Flip one checklist item and complete the phase once the threshold is
    /// met. Returns the updated flags.
    pub fn toggle_checklist_item(
        &self,
        unit: &CurriculumUnit,
        phase_id: &str,
        item: usize,
    ) -> Result<Vec<bool>> {
        let phase = find_phase(unit, phase_id)?;
        let len = phase.checklist.len();
        if item >= len {
            return Err(EngineError::ChecklistIndex { index: item, len });
        }

        self.update(&unit.id, |progress| {
            let state = progress.phase_mut(phase_id);
            if state.checklist.len() < len {
                state.checklist.resize(len, false);
            }
            state.checklist[item] = !state.checklist[item];
            if !state.completed && state.checked_count() >= checklist_threshold(len) {
                debug!(phase_id, "checklist threshold met");
                state.completed = true;
            }
            state.checklist.clone()
        })
    }

    pub fn unlocked_phases(&self, unit: &CurriculumUnit) -> Result<Vec<bool>> {
        Ok(compute_unlocked(&unit.phases, &self.unit_progress(&unit.id)?))
    }

    /// Move the resume pointer to an unlocked phase.
    pub fn select_phase(&self, unit: &CurriculumUnit, index: usize) -> Result<()> {
        validate_index(unit, index)?;
        if !self.unlocked_phases(unit)?[index] {
            return Err(EngineError::PhaseLocked(unit.phases[index].id.clone()));
        }
        self.set_current_phase(unit, index)
    }

    /// Finish the current phase and move to the next one.
    ///
    /// Phases with a checklist are completed only through their checklist.
    /// Returns the new index, or `None` when already at the last phase.
    pub fn advance(&self, unit: &CurriculumUnit) -> Result<Option<usize>> {
        let current = self.resume_phase_index(unit)?;
        let Some(phase) = unit.phase(current) else {
            return Ok(None);
        };
        if !phase.has_checklist() {
            self.complete_phase(&unit.id, &phase.id)?;
        }

        let next = current + 1;
        if next >= unit.phases.len() {
            return Ok(None);
        }
        self.select_phase(unit, next)?;
        Ok(Some(next))
    }
}

fn validate_index(unit: &CurriculumUnit, index: usize) -> Result<()> {
    if index >= unit.phases.len() {
        return Err(EngineError::InvalidPhaseIndex {
            unit: unit.id.clone(),
            index,
            count: unit.phases.len(),
        });
    }
    Ok(())
}

fn find_phase<'a>(unit: &'a CurriculumUnit, phase_id: &str) -> Result<&'a CurriculumPhase> {
    unit.find_phase(phase_id).ok_or_else(|| EngineError::UnknownPhase {
        unit: unit.id.clone(),
        phase: phase_id.to_string(),
    })
}

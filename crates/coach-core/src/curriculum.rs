//! Read-only curriculum records.
//!
//! Units are authored elsewhere and loaded as JSON. Field aliases accept the
//! authoring format's historical names (`etude_id`, `coach_prompt_smol`,
//! `coach_context`, `coach_goals`).

use serde::{Deserialize, Serialize};

use crate::models::Tier;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSupport {
    #[serde(default, alias = "smol")]
    pub local: Option<String>,
    #[serde(default)]
    pub frontier: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurriculumPhase {
    pub id: String,
    pub label: String,
    #[serde(default, alias = "coach_context")]
    pub context: Option<String>,
    #[serde(default, alias = "coach_goals")]
    pub goals: Vec<String>,
    #[serde(default)]
    pub suggested_questions: Vec<String>,
    #[serde(default)]
    pub checklist: Vec<String>,
    #[serde(default)]
    pub reflection_questions: Vec<String>,
}

impl CurriculumPhase {
    pub fn has_checklist(&self) -> bool {
        !self.checklist.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurriculumUnit {
    #[serde(alias = "etude_id")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub competency: Option<String>,
    #[serde(default)]
    pub tier_support: TierSupport,
    #[serde(default, alias = "coach_prompt_smol")]
    pub coach_prompt_local: String,
    #[serde(default)]
    pub coach_prompt_frontier: String,
    pub phases: Vec<CurriculumPhase>,
}

impl CurriculumUnit {
    pub fn phase(&self, index: usize) -> Option<&CurriculumPhase> {
        self.phases.get(index)
    }

    pub fn phase_index(&self, phase_id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == phase_id)
    }

    pub fn find_phase(&self, phase_id: &str) -> Option<&CurriculumPhase> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    /// Base coaching instruction for a tier.
    pub fn coach_prompt(&self, tier: Tier) -> &str {
        match tier {
            Tier::Local => &self.coach_prompt_local,
            Tier::Frontier => &self.coach_prompt_frontier,
        }
    }
}

//! System prompt assembly.
//!
//! The local tier gets a compact prompt: base instruction, phase header and
//! context, goals and suggested questions. The frontier tier additionally
//! carries the checklist and reflection questions. Empty sections are left
//! out entirely.

use coach_core::curriculum::{CurriculumPhase, CurriculumUnit};
use coach_core::Tier;

pub fn assemble_system_prompt(
    unit: &CurriculumUnit,
    phase_index: usize,
    tier: Tier,
) -> Option<String> {
    let phase = unit.phase(phase_index)?;
    let base = unit.coach_prompt(tier);
    let mut parts: Vec<String> = Vec::new();
    if !base.is_empty() {
        parts.push(base.to_string());
    }
    match tier {
        Tier::Local => local_sections(phase, &mut parts),
        Tier::Frontier => frontier_sections(phase, &mut parts),
    }
    Some(parts.join("\n"))
}

fn local_sections(phase: &CurriculumPhase, parts: &mut Vec<String>) {
    let mut header = format!("\nCurrent phase: {}", phase.label);
    if let Some(context) = phase_context(phase) {
        header.push('\n');
        header.push_str(context);
    }
    parts.push(header);

    if !phase.goals.is_empty() {
        parts.push(format!("\nGoals: {}.", phase.goals.join(". ")));
    }
    if let Some(list) = bullets(&phase.suggested_questions) {
        parts.push(format!("\nSuggested questions to ask:\n{list}"));
    }
}

fn frontier_sections(phase: &CurriculumPhase, parts: &mut Vec<String>) {
    parts.push(format!("\n--- Current Phase: {} ---", phase.label));
    if let Some(context) = phase_context(phase) {
        parts.push(context.to_string());
    }

    let sections = [
        ("Coaching goals for this phase:", &phase.goals),
        ("Suggested Socratic questions:", &phase.suggested_questions),
        ("Checklist items the student should evaluate:", &phase.checklist),
        ("Reflection questions:", &phase.reflection_questions),
    ];
    for (title, items) in sections {
        if let Some(list) = bullets(items) {
            parts.push(format!("\n{title}\n{list}"));
        }
    }
}

fn phase_context(phase: &CurriculumPhase) -> Option<&str> {
    phase.context.as_deref().filter(|c| !c.trim().is_empty())
}

fn bullets(items: &[String]) -> Option<String> {
    if items.is_empty() {
        return None;
    }
    Some(
        items
            .iter()
            .map(|item| format!("- {item}"))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

/// Opening coach message for a phase: its first suggested question, or a
/// generic invitation naming the phase.
pub fn initial_greeting(unit: &CurriculumUnit, phase_index: usize) -> Option<String> {
    let phase = unit.phase(phase_index)?;
    Some(match phase.suggested_questions.first() {
        Some(question) => question.clone(),
        None => format!(
            "Let's work through the \"{}\" phase. What are you working on?",
            phase.label
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> CurriculumUnit {
        serde_json::from_value(serde_json::json!({
            "id": "etude-02",
            "title": "Tracing",
            "coach_prompt_local": "You are a brief coach.",
            "coach_prompt_frontier": "You are a Socratic coach.",
            "phases": [
                {
                    "id": "setup",
                    "label": "Setup",
                    "context": "The student is choosing a project.",
                    "goals": ["Pick a scope", "Name a risk"],
                    "suggested_questions": ["What will you build?", "Why that?"],
                    "reflection_questions": ["What surprised you?"]
                },
                {
                    "id": "part1_checkpoint",
                    "label": "Checkpoint",
                    "checklist": ["Tests pass", "Docs written"]
                },
                { "id": "bare", "label": "Bare" }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn local_prompt_is_compact() {
        let prompt = assemble_system_prompt(&unit(), 0, Tier::Local).unwrap();
        assert_eq!(
            prompt,
            "You are a brief coach.\n\
             \nCurrent phase: Setup\nThe student is choosing a project.\n\
             \nGoals: Pick a scope. Name a risk.\n\
             \nSuggested questions to ask:\n- What will you build?\n- Why that?"
        );
        assert!(!prompt.contains("Reflection"));
    }

    #[test]
    fn local_prompt_omits_checklist() {
        let prompt = assemble_system_prompt(&unit(), 1, Tier::Local).unwrap();
        assert_eq!(prompt, "You are a brief coach.\n\nCurrent phase: Checkpoint");
    }

    #[test]
    fn frontier_prompt_carries_everything_present() {
        let prompt = assemble_system_prompt(&unit(), 0, Tier::Frontier).unwrap();
        assert_eq!(
            prompt,
            "You are a Socratic coach.\n\
             \n--- Current Phase: Setup ---\n\
             The student is choosing a project.\n\
             \nCoaching goals for this phase:\n- Pick a scope\n- Name a risk\n\
             \nSuggested Socratic questions:\n- What will you build?\n- Why that?\n\
             \nReflection questions:\n- What surprised you?"
        );
    }

    #[test]
    fn frontier_checklist_only_when_defined() {
        let with = assemble_system_prompt(&unit(), 1, Tier::Frontier).unwrap();
        assert!(with.contains(
            "Checklist items the student should evaluate:\n- Tests pass\n- Docs written"
        ));

        let without = assemble_system_prompt(&unit(), 0, Tier::Frontier).unwrap();
        assert!(!without.contains("Checklist"));

        let bare = assemble_system_prompt(&unit(), 2, Tier::Frontier).unwrap();
        assert_eq!(bare, "You are a Socratic coach.\n\n--- Current Phase: Bare ---");
    }

    #[test]
    fn out_of_range_phase() {
        assert!(assemble_system_prompt(&unit(), 3, Tier::Local).is_none());
        assert!(initial_greeting(&unit(), 3).is_none());
    }

    #[test]
    fn greeting_prefers_first_question() {
        assert_eq!(initial_greeting(&unit(), 0).as_deref(), Some("What will you build?"));
        assert_eq!(
            initial_greeting(&unit(), 2).as_deref(),
            Some("Let's work through the \"Bare\" phase. What are you working on?")
        );
    }
}

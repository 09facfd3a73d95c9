//! Token budgeting.
//!
//! Costs are estimated, not tokenized: `ceil(chars / 4)` per text plus a
//! fixed overhead per message.

use serde::Serialize;

use coach_core::models::{FRONTIER_CONTEXT_LIMIT, LOCAL_CONTEXT_LIMIT};
use coach_core::{Message, Tier};

/// Held back from the context for the reply.
pub const RESPONSE_RESERVE: usize = 500;
pub const MESSAGE_OVERHEAD: usize = 4;

pub fn estimate_text_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

pub fn estimate_message_tokens(message: &Message) -> usize {
    estimate_text_tokens(&message.content) + MESSAGE_OVERHEAD
}

pub fn estimate_conversation_tokens(system_prompt: &str, transcript: &[Message]) -> usize {
    estimate_text_tokens(system_prompt)
        + transcript.iter().map(estimate_message_tokens).sum::<usize>()
}

pub fn context_limit(tier: Tier) -> usize {
    match tier {
        Tier::Local => LOCAL_CONTEXT_LIMIT,
        Tier::Frontier => FRONTIER_CONTEXT_LIMIT,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageWarning {
    Moderate,
    High,
    Critical,
}

impl UsageWarning {
    /// Moderate is only raised for the local tier, whose window is small
    /// enough for it to matter.
    pub fn classify(percentage: f64, tier: Tier) -> Option<Self> {
        if percentage > 90.0 {
            Some(Self::Critical)
        } else if percentage > 75.0 {
            Some(Self::High)
        } else if percentage > 50.0 && tier == Tier::Local {
            Some(Self::Moderate)
        } else {
            None
        }
    }
}

impl std::fmt::Display for UsageWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Moderate => f.write_str("moderate"),
            Self::High => f.write_str("high"),
            Self::Critical => f.write_str("critical"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContextUsage {
    pub used: usize,
    pub limit: usize,
    pub percentage: f64,
    pub warning: Option<UsageWarning>,
}

pub fn check_context_usage(
    system_prompt: &str,
    transcript: &[Message],
    tier: Tier,
) -> ContextUsage {
    let used = estimate_conversation_tokens(system_prompt, transcript);
    let limit = context_limit(tier);
    let percentage = used as f64 / limit as f64 * 100.0;
    ContextUsage {
        used,
        limit,
        percentage,
        warning: UsageWarning::classify(percentage, tier),
    }
}

/// Fit `transcript` into the tier's window after the system prompt and the
/// reply reserve.
///
/// The first message is kept when its cost is strictly below the budget.
/// Then the most recent messages are taken walking backwards until the next
/// one would overflow. Everything in between is dropped. Order is preserved.
pub fn truncate_conversation(
    transcript: &[Message],
    system_prompt: &str,
    tier: Tier,
) -> Vec<Message> {
    truncate_to_limit(transcript, system_prompt, context_limit(tier))
}

pub fn truncate_to_limit(
    transcript: &[Message],
    system_prompt: &str,
    limit: usize,
) -> Vec<Message> {
    let reserved = estimate_text_tokens(system_prompt) + RESPONSE_RESERVE;
    let Some(available) = limit.checked_sub(reserved).filter(|a| *a > 0) else {
        return Vec::new();
    };

    let mut kept = Vec::new();
    let mut used = 0;
    if let Some(first) = transcript.first() {
        let cost = estimate_message_tokens(first);
        if cost < available {
            kept.push(first.clone());
            used += cost;
        }
    }

    let mut recent = Vec::new();
    for message in transcript.iter().skip(1).rev() {
        let cost = estimate_message_tokens(message);
        if used + cost > available {
            break;
        }
        used += cost;
        recent.push(message.clone());
    }
    kept.extend(recent.into_iter().rev());
    kept
}

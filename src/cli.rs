use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use coach_core::Tier;

#[derive(Parser)]
#[command(name = "coach", version, about = "Socratic coaching companion for curriculum units")]
pub struct Cli {
    /// Log level for this run; overrides the configured level.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List the selectable models.
    Models,

    /// Show a unit's phases, locks and checklists.
    Show { unit: PathBuf },

    /// Print the system prompt for a phase.
    Prompt {
        unit: PathBuf,
        /// Phase number (1-based). Defaults to the resume point.
        #[arg(long)]
        phase: Option<usize>,
        /// Defaults to the tier of the selected model.
        #[arg(long, value_enum)]
        tier: Option<TierArg>,
    },

    /// Mark a phase completed.
    Complete { unit: PathBuf, phase: String },

    /// Toggle a checklist item (1-based).
    Check {
        unit: PathBuf,
        phase: String,
        item: usize,
    },

    /// Move to an unlocked phase (1-based).
    Select { unit: PathBuf, phase: usize },

    /// Finish the current phase and move to the next.
    Advance { unit: PathBuf },

    /// Select the model used for chat.
    Use { model: String },

    /// Manage provider API keys.
    Keys {
        #[command(subcommand)]
        action: KeysCommand,
    },

    /// Interactive coaching session.
    Chat {
        unit: PathBuf,
        /// Use this model for the session without changing the preference.
        #[arg(long)]
        model: Option<String>,
        /// Start at this phase (1-based) instead of the resume point.
        #[arg(long)]
        phase: Option<usize>,
    },
}

#[derive(Subcommand)]
pub enum KeysCommand {
    /// Store a key. Reads it from stdin when no value is given.
    Set { name: String, value: Option<String> },
    Remove { name: String },
    List,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum TierArg {
    Local,
    Frontier,
}

impl From<TierArg> for Tier {
    fn from(arg: TierArg) -> Self {
        match arg {
            TierArg::Local => Tier::Local,
            TierArg::Frontier => Tier::Frontier,
        }
    }
}

/// Convert a 1-based phase number from the command line.
pub fn phase_index(number: usize) -> anyhow::Result<usize> {
    number
        .checked_sub(1)
        .ok_or_else(|| anyhow::anyhow!("phase numbers start at 1"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys_set_without_value() {
        let cli = Cli::try_parse_from(["coach", "keys", "set", "anthropic"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Keys {
                action: KeysCommand::Set { ref name, value: None }
            } if name == "anthropic"
        ));
    }

    #[test]
    fn parses_prompt_flags() {
        let args = ["coach", "prompt", "unit.json", "--phase", "2", "--tier", "frontier"];
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Command::Prompt { phase, tier, .. } => {
                assert_eq!(phase, Some(2));
                assert_eq!(tier.map(Tier::from), Some(Tier::Frontier));
            }
            _ => panic!("expected prompt"),
        }
    }

    #[test]
    fn phase_numbers_are_one_based() {
        assert_eq!(phase_index(1).unwrap(), 0);
        assert!(phase_index(0).is_err());
    }
}

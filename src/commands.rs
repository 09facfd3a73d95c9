use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use coach_core::curriculum::{CurriculumPhase, CurriculumUnit};
use coach_core::models::{all_models, find_model};
use coach_core::{Role, StatusUpdate, Tier};
use coach_engine::{assemble_system_prompt, CoachSession, EngineError};
use coach_llm::UnifiedAdapter;

use crate::app::{load_unit, App};
use crate::cli::{phase_index, KeysCommand, TierArg};

pub fn models(app: &App) -> anyhow::Result<()> {
    let selected = app.preferences.model_preference()?;
    let credentials = app.preferences.effective_credentials()?;
    for model in all_models() {
        let marker = if model.id == selected.id { "*" } else { " " };
        let access = match model.credential_name {
            None => "on-device",
            Some(name) if credentials.get(name).is_some() => "key set",
            Some(_) => "needs key",
        };
        println!(
            "{marker} {:<10} {:<18} {:<9} {}",
            model.id, model.label, model.tier, access
        );
    }
    Ok(())
}

pub fn show(app: &App, path: &Path) -> anyhow::Result<()> {
    let unit = load_unit(path)?;
    let progress = app.progress.unit_progress(&unit.id)?;
    let unlocked = app.progress.unlocked_phases(&unit)?;
    let current = app.progress.resume_phase_index(&unit)?;
    let saved = app.saved_transcripts(&unit)?;

    println!("{} ({})", unit.title, unit.id);
    if let Some(competency) = &unit.competency {
        println!("Competency: {competency}");
    }
    for (index, phase) in unit.phases.iter().enumerate() {
        let pointer = if index == current { ">" } else { " " };
        let state = if progress.is_completed(&phase.id) {
            "done"
        } else if unlocked[index] {
            "open"
        } else {
            "locked"
        };
        let chat = if saved[index] { "  (chat saved)" } else { "" };
        println!("{pointer} {:>2}. {:<28} {state}{chat}", index + 1, phase.label);

        let checked = progress
            .phase(&phase.id)
            .map(|p| p.checklist.as_slice())
            .unwrap_or_default();
        for (item, label) in phase.checklist.iter().enumerate() {
            let mark = if checked.get(item).copied().unwrap_or(false) { "x" } else { " " };
            println!("       [{mark}] {}. {label}", item + 1);
        }
    }
    if app.progress.is_unit_completed(&unit.id, unit.phases.len())? {
        println!("Unit completed.");
    }
    Ok(())
}

pub fn prompt(
    app: &App,
    path: &Path,
    phase: Option<usize>,
    tier: Option<TierArg>,
) -> anyhow::Result<()> {
    let unit = load_unit(path)?;
    let index = match phase {
        Some(number) => phase_index(number)?,
        None => app.progress.resume_phase_index(&unit)?,
    };
    let tier = match tier {
        Some(arg) => Tier::from(arg),
        None => app.preferences.model_preference()?.tier,
    };
    let prompt = assemble_system_prompt(&unit, index, tier)
        .ok_or_else(|| anyhow!("unit {} has no phase {}", unit.id, index + 1))?;
    println!("{prompt}");
    Ok(())
}

pub fn complete(app: &App, path: &Path, phase_id: &str) -> anyhow::Result<()> {
    let unit = load_unit(path)?;
    let phase = find_phase(&unit, phase_id)?;
    app.progress.complete_phase(&unit.id, &phase.id)?;
    println!("Completed {}.", phase.label);
    Ok(())
}

pub fn check(app: &App, path: &Path, phase_id: &str, item: usize) -> anyhow::Result<()> {
    let unit = load_unit(path)?;
    let item = item
        .checked_sub(1)
        .ok_or_else(|| anyhow!("checklist items start at 1"))?;
    let phase = find_phase(&unit, phase_id)?;
    let flags = app.progress.toggle_checklist_item(&unit, phase_id, item)?;
    let state = if flags[item] { "checked" } else { "unchecked" };
    println!("{state}: {}", phase.checklist[item]);
    if app.progress.is_phase_completed(&unit.id, phase_id)? {
        println!("{} is complete.", phase.label);
    }
    Ok(())
}

pub fn select(app: &App, path: &Path, number: usize) -> anyhow::Result<()> {
    let unit = load_unit(path)?;
    let index = phase_index(number)?;
    app.progress.select_phase(&unit, index)?;
    println!("Now on {}.", unit.phases[index].label);
    Ok(())
}

pub fn advance(app: &App, path: &Path) -> anyhow::Result<()> {
    let unit = load_unit(path)?;
    match app.progress.advance(&unit)? {
        Some(next) => println!("Now on {}.", unit.phases[next].label),
        None => println!("Already on the last phase."),
    }
    Ok(())
}

pub fn use_model(app: &App, id: &str) -> anyhow::Result<()> {
    let model = app.preferences.set_model_preference(id)?;
    println!("Using {} ({}).", model.label, model.tier);
    if let Some(name) = model.credential_name {
        if app.preferences.effective_credentials()?.get(name).is_none() {
            println!("No {name} key is set; add one with `coach keys set {name}`.");
        }
    }
    Ok(())
}

pub fn keys(app: &App, action: KeysCommand) -> anyhow::Result<()> {
    match action {
        KeysCommand::Set { name, value } => {
            let value = match value {
                Some(value) => value,
                None => read_secret(&name)?,
            };
            app.preferences.set_credential(&name, &value)?;
            println!("Stored {name} key.");
        }
        KeysCommand::Remove { name } => {
            if app.preferences.remove_credential(&name)? {
                println!("Removed {name} key.");
            } else {
                println!("No stored {name} key.");
            }
        }
        KeysCommand::List => {
            let stored = app.preferences.credential_names()?;
            let effective = app.preferences.effective_credentials()?;
            for name in effective.names() {
                let source = if stored.iter().any(|s| s == name) {
                    "stored"
                } else {
                    "environment"
                };
                println!("{name:<10} {source}");
            }
        }
    }
    Ok(())
}

fn read_secret(name: &str) -> anyhow::Result<String> {
    eprint!("{name} key: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("failed to read key from stdin")?;
    Ok(line.trim().to_string())
}

fn find_phase<'a>(
    unit: &'a CurriculumUnit,
    phase_id: &str,
) -> anyhow::Result<&'a CurriculumPhase> {
    unit.find_phase(phase_id)
        .ok_or_else(|| anyhow!("unit {} has no phase {phase_id}", unit.id))
}

pub async fn chat(
    app: &App,
    path: &Path,
    model: Option<String>,
    phase: Option<usize>,
) -> anyhow::Result<()> {
    let unit = load_unit(path)?;
    let model = match model {
        Some(id) => find_model(&id).ok_or_else(|| anyhow!("unknown model: {id}"))?,
        None => app.preferences.model_preference()?,
    };
    let index = match phase {
        Some(number) => {
            let index = phase_index(number)?;
            app.progress.select_phase(&unit, index)?;
            index
        }
        None => app.progress.resume_phase_index(&unit)?,
    };

    let mut adapter = UnifiedAdapter::new(Arc::new(app.backend_factory()?));
    adapter.on_status_change(Arc::new(|update: &StatusUpdate| {
        if let Some(message) = &update.message {
            eprintln!("[{}] {message}", update.status);
        }
    }));
    let credentials = app.preferences.effective_credentials()?;
    adapter
        .switch_model(model.id, &credentials)
        .await
        .with_context(|| format!("failed to start {}", model.label))?;
    info!(model = model.id, unit = %unit.id, "chat started");

    let mut session = CoachSession::open(unit.clone(), index, app.transcripts.clone())?;
    print_phase(&session);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/usage" => {
                let usage = session.context_usage(adapter.model_tier());
                let warning = usage.warning.map(|w| format!(" ({w})")).unwrap_or_default();
                println!(
                    "{} / {} tokens, {:.1}%{warning}",
                    usage.used, usage.limit, usage.percentage
                );
            }
            "/next" => match app.progress.advance(&unit) {
                Ok(Some(next)) => {
                    session = CoachSession::open(unit.clone(), next, app.transcripts.clone())?;
                    print_phase(&session);
                }
                Ok(None) => println!("Already on the last phase."),
                Err(EngineError::PhaseLocked(_)) => {
                    println!("The next phase is locked; finish this phase's checklist first.")
                }
                Err(e) => return Err(e.into()),
            },
            text => {
                let exchange = session
                    .send(&adapter, text, |token| {
                        print!("{token}");
                        let _ = std::io::stdout().flush();
                    })
                    .await?;
                if exchange.is_error() {
                    println!();
                    print!("{}", exchange.reply.content);
                }
                println!();
                if let Some(warning) = session.context_usage(adapter.model_tier()).warning {
                    eprintln!("[context usage {warning}]");
                }
            }
        }
    }

    adapter.destroy();
    Ok(())
}

fn print_phase(session: &CoachSession) {
    let phase = session.phase();
    println!(
        "--- {} ({}/{}) ---",
        phase.label,
        session.phase_index() + 1,
        session.unit().phases.len()
    );
    for message in session.transcript() {
        match message.role {
            Role::User => println!("> {}", message.content),
            _ => println!("{}", message.content),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coach_settings::CoachSettings;

    fn app() -> (tempfile::TempDir, App) {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = CoachSettings::default();
        settings.storage.data_dir = dir.path().to_string_lossy().into_owned();
        settings.storage.encrypt_credentials = false;
        let app = App::open(settings).unwrap();
        (dir, app)
    }

    fn write_unit(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("unit.json");
        std::fs::write(
            &path,
            r#"{"id":"etude-01","title":"Intro","phases":[
                {"id":"setup","label":"Setup"},
                {"id":"part1_checkpoint","label":"Checkpoint","checklist":["a","b"]},
                {"id":"part2_work","label":"Part 2"}]}"#,
        )
        .unwrap();
        path
    }

    #[test]
    fn progress_commands_drive_the_store() {
        let (dir, app) = app();
        let unit_path = write_unit(dir.path());

        advance(&app, &unit_path).unwrap();
        assert!(select(&app, &unit_path, 3).is_err());
        check(&app, &unit_path, "part1_checkpoint", 2).unwrap();
        select(&app, &unit_path, 3).unwrap();
        assert!(check(&app, &unit_path, "part1_checkpoint", 0).is_err());
        show(&app, &unit_path).unwrap();

        let unit = load_unit(&unit_path).unwrap();
        assert_eq!(app.progress.resume_phase_index(&unit).unwrap(), 2);
    }

    #[test]
    fn use_rejects_unknown_model() {
        let (_dir, app) = app();
        assert!(use_model(&app, "gpt-9").is_err());
        use_model(&app, "google").unwrap();
        assert_eq!(app.preferences.model_preference().unwrap().id, "google");
    }
}

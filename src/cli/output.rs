//! CLI output formatting

use crate::core::{RunStatus, StageState};
use crate::exec::RunEvent;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static BROOM: Emoji<'_, '_> = Emoji("🧹 ", "- ");

/// Create a progress bar over the plan's stages
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format a stage state for display
pub fn format_stage_state(state: &StageState) -> String {
    match state {
        StageState::Pending => style("PENDING").dim().to_string(),
        StageState::Installing { .. } => style("INSTALLING").yellow().to_string(),
        StageState::Waiting { .. } => style("WAITING").yellow().to_string(),
        StageState::Ready { .. } => style("READY").green().to_string(),
        StageState::Failed { .. } => style("FAILED").red().to_string(),
        StageState::Skipped { .. } => style("SKIPPED").dim().to_string(),
    }
}

/// Format a run status for display
pub fn format_status(status: RunStatus) -> String {
    match status {
        RunStatus::Pending => style("PENDING").dim().to_string(),
        RunStatus::Running => style("RUNNING").yellow().to_string(),
        RunStatus::Completed => style("COMPLETED").green().to_string(),
        RunStatus::Failed => style("FAILED").red().to_string(),
        RunStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// Format a run event for display
pub fn format_run_event(event: &RunEvent) -> String {
    match event {
        RunEvent::RunStarted {
            run_id,
            plan_name,
            total_stages,
        } => format!(
            "{} Starting {} ({} stages, run {})",
            ROCKET,
            style(plan_name).bold(),
            style(total_stages).cyan(),
            style(&run_id.to_string()[..8]).dim()
        ),
        RunEvent::StageStarted {
            stage_id,
            stage_name,
            position,
        } => format!(
            "{} [{}] {} ({})",
            SPINNER,
            style(position).dim(),
            style(stage_name).cyan(),
            style(stage_id).dim()
        ),
        RunEvent::StageWaiting { stage_id, target } => format!(
            "{} {} waiting for {}",
            SPINNER,
            style(stage_id).cyan(),
            style(target).dim()
        ),
        RunEvent::StageReady { stage_id, waited } => format!(
            "{} {} ready after {}",
            CHECK,
            style(stage_id).cyan(),
            style(format_duration(*waited)).dim()
        ),
        RunEvent::StageFailed { stage_id, error } => format!(
            "{} {} failed: {}",
            CROSS,
            style(stage_id).cyan(),
            style(error).red()
        ),
        RunEvent::RunCompleted { status, .. } => {
            format!("{} Run {}", INFO, format_status(*status))
        }
        RunEvent::TeardownStarted { plan_name } => {
            format!("{} Tearing down {}", BROOM, style(plan_name).bold())
        }
        RunEvent::StageRemoved { stage_id } => {
            format!("{} {} removed", CHECK, style(stage_id).cyan())
        }
        RunEvent::StageSkipped { stage_id, reason } => format!(
            "{} {} skipped ({})",
            WARN,
            style(stage_id).cyan(),
            style(reason).dim()
        ),
        RunEvent::TeardownCompleted {
            removed,
            skipped,
            failed,
        } => format!(
            "{} Teardown finished: {} removed, {} skipped, {} failed",
            INFO,
            style(removed).green(),
            style(skipped).yellow(),
            style(failed).red()
        ),
    }
}

/// Human-readable duration
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

//! CLI command definitions

use std::path::PathBuf;

use clap::{Args, Subcommand};

/// Install all lab stages
#[derive(Debug, Args, Clone)]
pub struct BootstrapCommand {
    /// Path to plan YAML file (omit for the built-in plan)
    #[arg(short, long)]
    pub plan: Option<String>,

    /// Answers file for unattended runs (flat YAML map of prompt
    /// label to value)
    #[arg(long)]
    pub answers: Option<PathBuf>,

    /// Variable overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub set: Vec<(String, String)>,

    /// Kubeconfig path (defaults to the k3s location)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// SSH private key seeded into the store (generated when missing)
    #[arg(long)]
    pub ssh_key: Option<PathBuf>,
}

/// Remove lab stages in reverse order
#[derive(Debug, Args, Clone)]
pub struct TeardownCommand {
    /// Path to plan YAML file (omit for the built-in plan)
    #[arg(short, long)]
    pub plan: Option<String>,

    /// Answer yes to all confirmation prompts
    #[arg(short, long)]
    pub yes: bool,

    /// Kubeconfig path (defaults to the k3s location)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,
}

/// Validate a plan file
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to plan YAML file (omit for the built-in plan)
    #[arg(short, long)]
    pub plan: Option<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Cloud topology management
#[derive(Debug, Args, Clone)]
pub struct InfraCommand {
    /// Path to topology YAML file
    #[arg(short, long)]
    pub config: String,

    /// State location: a local path or an s3://bucket/key URI
    /// (defaults to ~/.labforge/infra.json)
    #[arg(long)]
    pub state: Option<String>,

    #[command(subcommand)]
    pub action: InfraAction,
}

#[derive(Debug, Subcommand, Clone)]
pub enum InfraAction {
    /// Show what apply would create or replace
    Plan,

    /// Create missing resources and repair interrupted ones
    Apply,

    /// Tear the topology down in reverse order
    Destroy {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Print outputs from the last apply
    Output {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 {
        return Err(format!("Invalid key=value pair: {}", s));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

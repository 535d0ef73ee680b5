//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{BootstrapCommand, InfraCommand, TeardownCommand, ValidateCommand};

/// Network lab bootstrap and teardown orchestrator
#[derive(Debug, Parser, Clone)]
#[command(name = "labforge")]
#[command(version = "0.1.0")]
#[command(about = "Bootstrap a k3s network lab and its cloud topology", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Install all lab stages in dependency order
    Bootstrap(BootstrapCommand),

    /// Remove lab stages in reverse install order
    Teardown(TeardownCommand),

    /// Validate a plan file
    Validate(ValidateCommand),

    /// Manage the cloud topology (VPN gateway + simulation host)
    Infra(InfraCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}

use std::ffi::OsString;

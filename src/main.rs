use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, warn, Level};
use tracing_subscriber::FmtSubscriber;

use labforge::cli::commands::{
    BootstrapCommand, InfraAction, InfraCommand, TeardownCommand, ValidateCommand,
};
use labforge::cli::output::*;
use labforge::cli::{Cli, Command};
use labforge::cluster::ShellCluster;
use labforge::core::{PlanConfig, RunContext, Sensitive, StageKind};
use labforge::exec::{BootstrapEngine, RunEvent};
use labforge::infra::ec2::Ec2CliProvider;
use labforge::infra::wireguard::WgTool;
use labforge::infra::{
    LocalStateBackend, Provisioner, S3StateBackend, StateBackend, TopologyConfig,
};
use labforge::secrets::input::{InputProvider, InteractiveInput, PresetInput};
use labforge::secrets::vault::VaultCliStore;
use labforge::secrets::{generate_token, SshKeygen};
use labforge::stages::LabDriver;

const K3S_KUBECONFIG: &str = "/etc/rancher/k3s/k3s.yaml";
const STORE_TOKEN_PROMPT: &str = "Secret store root token";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Bootstrap(cmd) => bootstrap(cmd).await?,
        Command::Teardown(cmd) => teardown(cmd).await?,
        Command::Validate(cmd) => validate(cmd)?,
        Command::Infra(cmd) => infra(cmd).await?,
    }

    Ok(())
}

fn load_plan_config(path: Option<&str>) -> Result<PlanConfig> {
    match path {
        Some(path) => PlanConfig::from_file(path).context("Failed to load plan"),
        None => PlanConfig::from_yaml(labforge::DEFAULT_PLAN).context("Built-in plan is invalid"),
    }
}

fn plan_dir(path: Option<&str>) -> PathBuf {
    path.and_then(|p| PathBuf::from(p).parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".labforge")
}

fn input_provider(answers: Option<&PathBuf>, assume_yes: bool) -> Result<Arc<dyn InputProvider>> {
    Ok(match answers {
        Some(path) => Arc::new(PresetInput::from_file(path, assume_yes)?),
        None => Arc::new(InteractiveInput),
    })
}

/// The dev-mode store's root token. Prompted so an operator can reuse
/// a known one; generated when the prompt has no answer.
fn store_token(input: &dyn InputProvider) -> Sensitive {
    match input.prompt_secret(STORE_TOKEN_PROMPT) {
        Ok(token) if !token.is_empty() => token,
        _ => Sensitive::new(generate_token()),
    }
}

async fn bootstrap(cmd: &BootstrapCommand) -> Result<()> {
    let mut config = load_plan_config(cmd.plan.as_deref())?;
    println!("{} Loaded plan: {}", INFO, style(&config.name).bold());

    for (key, value) in &cmd.set {
        config.variables.insert(key.clone(), value.clone());
        println!(
            "{} Variable override: {} = {}",
            INFO,
            style(key).cyan(),
            style(value).dim()
        );
    }

    let mut plan = config.to_plan();

    let store_addr = plan
        .stages
        .values()
        .find_map(|s| match &s.kind {
            StageKind::VaultDev { addr } => Some(addr.clone()),
            _ => None,
        })
        .unwrap_or_else(|| "http://127.0.0.1:8200".to_string());

    let input = input_provider(cmd.answers.as_ref(), false)?;
    let token = store_token(input.as_ref());

    let ssh_key_path = cmd
        .ssh_key
        .clone()
        .unwrap_or_else(|| data_dir().join("ssh").join("id_ed25519"));
    let mut ctx = RunContext::new(store_addr.clone(), token.duplicate(), ssh_key_path);
    ctx.merge_variables(config.variables.clone());
    // Manifests reference the store by address (the sync operator runs
    // inside the cluster)
    ctx.set_variable("store_addr".to_string(), store_addr.clone());

    let kubeconfig = cmd
        .kubeconfig
        .clone()
        .or_else(|| Some(PathBuf::from(K3S_KUBECONFIG)));
    let cluster = ShellCluster::new(kubeconfig);
    let store = Arc::new(VaultCliStore::new(store_addr, token, "secret"));
    let driver = LabDriver::new(
        cluster,
        store,
        Arc::clone(&input),
        Arc::new(SshKeygen),
        plan_dir(cmd.plan.as_deref()),
    );

    let engine = BootstrapEngine::new(driver);
    let progress = create_progress_bar(plan.stages.len());
    {
        let progress = progress.clone();
        engine.add_event_handler(move |event| {
            progress.println(format_run_event(&event));
            if matches!(event, RunEvent::StageReady { .. }) {
                progress.inc(1);
            }
        });
    }

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n{} Interrupt received, stopping after current wait", WARN);
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    println!();
    let result = engine.bootstrap(&mut plan, &mut ctx, &cancel).await;
    progress.finish_and_clear();

    match result {
        Ok(()) => {
            println!(
                "\n{} {} is {}",
                CHECK,
                style(&plan.name).bold(),
                style("up").green()
            );
            Ok(())
        }
        Err(e) => {
            println!(
                "\n{} {} {}",
                CROSS,
                style(&plan.name).bold(),
                style("failed").red()
            );
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

async fn teardown(cmd: &TeardownCommand) -> Result<()> {
    let config = load_plan_config(cmd.plan.as_deref())?;
    println!("{} Loaded plan: {}", INFO, style(&config.name).bold());
    let plan = config.to_plan();

    let input: Arc<dyn InputProvider> = if cmd.yes {
        Arc::new(PresetInput::new(Default::default(), true))
    } else {
        Arc::new(InteractiveInput)
    };

    // No store token is needed to remove things
    let mut ctx = RunContext::new(
        "http://127.0.0.1:8200".to_string(),
        Sensitive::new(String::new()),
        data_dir().join("ssh").join("id_ed25519"),
    );
    ctx.merge_variables(config.variables.clone());

    let kubeconfig = cmd
        .kubeconfig
        .clone()
        .or_else(|| Some(PathBuf::from(K3S_KUBECONFIG)));
    let cluster = ShellCluster::new(kubeconfig);
    let store = Arc::new(VaultCliStore::new(
        ctx.store_addr.clone(),
        Sensitive::new(String::new()),
        "secret",
    ));
    let driver = LabDriver::new(
        cluster,
        store,
        Arc::clone(&input),
        Arc::new(SshKeygen),
        plan_dir(cmd.plan.as_deref()),
    );

    let engine = BootstrapEngine::new(driver);
    engine.add_event_handler(|event| {
        println!("{}", format_run_event(&event));
    });

    println!();
    let report = engine.teardown(&plan, &ctx, input.as_ref()).await;

    if report.is_clean() {
        Ok(())
    } else {
        for (stage, error) in &report.failed {
            error!(stage = %stage, "{error}");
        }
        for stage in &report.skipped {
            warn!(stage = %stage, "Left in place, remove manually if needed");
        }
        std::process::exit(1);
    }
}

fn validate(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating plan...", INFO);

    let result = load_plan_config(cmd.plan.as_deref());
    match result {
        Ok(config) => {
            println!("{} Plan configuration is valid!", CHECK);
            println!("  Name: {}", style(&config.name).bold());
            println!("  Stages: {}", style(config.stages.len()).cyan());
            println!("  Variables: {}", style(config.variables.len()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(e).red());
            std::process::exit(1);
        }
    }
}

async fn infra(cmd: &InfraCommand) -> Result<()> {
    let config = TopologyConfig::from_file(&cmd.config)?;
    let wg_config_path = data_dir().join("wg0.conf");

    let provider = Ec2CliProvider::new(config.region.clone());
    let backend: Box<dyn StateBackend> = match cmd.state.as_deref() {
        Some(uri) if uri.starts_with("s3://") => Box::new(S3StateBackend::from_uri(uri)?),
        Some(path) => Box::new(LocalStateBackend::new(path)),
        None => Box::new(LocalStateBackend::new(data_dir().join("infra.json"))),
    };
    let provisioner = Provisioner::new(
        provider,
        backend,
        config,
        Box::new(WgTool),
        wg_config_path,
    );

    let cancel = AtomicBool::new(false);

    match &cmd.action {
        InfraAction::Plan => {
            let actions = provisioner.plan().await?;
            for action in &actions {
                match action {
                    labforge::infra::PlanAction::Create { resource } => {
                        println!("  {} {}", style("+").green(), resource)
                    }
                    labforge::infra::PlanAction::Replace { resource } => {
                        println!("  {} {}", style("~").yellow(), resource)
                    }
                    labforge::infra::PlanAction::Keep { resource } => {
                        println!("  {} {}", style("=").dim(), resource)
                    }
                }
            }
        }
        InfraAction::Apply => {
            let state = provisioner.apply(&cancel).await?;
            println!("\n{} Topology is up", CHECK);
            for (key, value) in &state.outputs {
                println!("  {} = {}", style(key).cyan(), value);
            }
        }
        InfraAction::Destroy { yes } => {
            if !yes {
                let confirmed = InteractiveInput
                    .confirm("Destroy the entire cloud topology?", false)?;
                if !confirmed {
                    println!("{} Aborted", INFO);
                    return Ok(());
                }
            }
            provisioner.destroy(&cancel).await?;
            println!("{} Topology destroyed", CHECK);
        }
        InfraAction::Output { json } => {
            let outputs = provisioner.outputs()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&outputs)?);
            } else {
                for (key, value) in &outputs {
                    println!("{key} = {value}");
                }
            }
        }
    }

    Ok(())
}

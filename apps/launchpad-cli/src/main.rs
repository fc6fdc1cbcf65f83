//! Launchpad - provision an on-demand container job launcher and serve its trigger

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use launchpad_core::api;
use launchpad_core::stack::{DeploymentScope, Provisioner, StackDefinition};
use launchpad_core::synth::{synthesize, SynthOptions};
use launchpad_core::LaunchConfig;

#[derive(Parser, Debug)]
#[command(name = "launchpad", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the stack as a CloudFormation template
    Synth(SynthArgs),

    /// Provision the stack in memory and print its outputs
    Provision(ConfigArgs),

    /// Provision the stack and serve the trigger endpoint over HTTP
    ///
    /// Runs are scheduled on an in-memory serverless pool; each invocation
    /// starts exactly one run of the job template.
    Serve(ServeArgs),
}

#[derive(Parser, Debug)]
struct ConfigArgs {
    /// Stack settings YAML. Defaults apply when omitted.
    #[arg(short = 'c', long = "config", env = "LAUNCHPAD_CONFIG")]
    config_file: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct SynthArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Print LICENSE_EMAIL and LICENSE_SIGNATURE instead of masking them
    #[arg(long)]
    show_secrets: bool,
}

#[derive(Parser, Debug)]
struct ServeArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long, env = "LAUNCHPAD_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Maximum concurrently running tasks in the pool (unbounded when omitted)
    #[arg(long)]
    capacity: Option<usize>,

    /// Seconds each run's container stays up before exiting with code 0
    #[arg(long, env = "LAUNCHPAD_RUN_SECONDS", default_value_t = 60)]
    run_seconds: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Synth(args) => run_synth(args),
        Commands::Provision(args) => run_provision(args),
        Commands::Serve(args) => run_serve(args).await,
    }
}

fn load_definition(args: &ConfigArgs) -> anyhow::Result<StackDefinition> {
    let config = LaunchConfig::load(args.config_file.as_deref())
        .context("Failed to load configuration")?;
    Ok(StackDefinition::from_config(config))
}

fn run_synth(args: SynthArgs) -> anyhow::Result<()> {
    let definition = load_definition(&args.config)?;
    let template = synthesize(
        &definition,
        SynthOptions {
            show_secrets: args.show_secrets,
        },
    )
    .context("Failed to synthesize template")?;
    println!("{}", serde_json::to_string_pretty(&template)?);
    Ok(())
}

fn run_provision(args: ConfigArgs) -> anyhow::Result<()> {
    let definition = load_definition(&args)?;
    let stack = Provisioner::new(DeploymentScope::new())
        .provision(&definition)
        .context("Failed to provision stack")?;

    println!("{}", serde_json::to_string_pretty(&stack.outputs())?);
    Ok(())
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let definition = load_definition(&args.config)?;
    let stack = Provisioner::new(DeploymentScope::new())
        .provision(&definition)
        .context("Failed to provision stack")?;

    let mut pool = stack
        .pool()
        .with_run_duration(Duration::from_secs(args.run_seconds));
    if let Some(capacity) = args.capacity {
        pool = pool.with_capacity(capacity);
    }
    let endpoint = stack.trigger_endpoint(Arc::new(pool));
    let app = api::router(endpoint);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    let addr = listener.local_addr().context("Failed to read bound address")?;

    for line in serve_banner(&stack.outputs(), addr) {
        println!("{line}");
    }
    tracing::info!(%addr, function = %stack.trigger.function_name, "Trigger endpoint listening");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

/// Stack outputs followed by the address the trigger actually answers on.
/// `LambdaUrl` is the provisioned address, not the local listener.
fn serve_banner(outputs: &BTreeMap<&str, String>, addr: SocketAddr) -> Vec<String> {
    outputs
        .iter()
        .map(|(name, value)| format!("{name} = {value}"))
        .chain(std::iter::once(format!("TriggerUrl = http://{addr}/")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banner_names_the_bound_address() {
        let outputs = BTreeMap::from([(
            "LambdaUrl",
            "https://abc.lambda-url.us-east-1.on.aws/".to_string(),
        )]);
        let addr: SocketAddr = "127.0.0.1:41234".parse().unwrap();

        let banner = serve_banner(&outputs, addr);
        assert_eq!(
            banner,
            vec![
                "LambdaUrl = https://abc.lambda-url.us-east-1.on.aws/".to_string(),
                "TriggerUrl = http://127.0.0.1:41234/".to_string(),
            ]
        );
    }

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::parse_from(["launchpad", "serve"]);
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.run_seconds, 60);
        assert!(args.capacity.is_none());
    }
}

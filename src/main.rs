use std::path::PathBuf;
use std::sync::Arc;

use structopt::StructOpt;
use tracing::{error, info};

use device_plugin::cdi::StaticCdiHandler;
use device_plugin::config::{Config, DeviceIdStrategy, DeviceListStrategy, MigStrategy};
use device_plugin::supervisor::Supervisor;

mod nvml;

#[derive(StructOpt, Clone, Debug)]
#[structopt(
    name = "nvidia-device-plugin",
    about = "A device plugin that advertises NVIDIA GPUs to the kubelet"
)]
struct Opts {
    #[structopt(
        long = "config-file",
        env = "CONFIG_FILE",
        help = "Path to the plugin configuration file; reloaded on every soft restart"
    )]
    config_file: Option<PathBuf>,

    #[structopt(
        long = "mig-strategy",
        env = "MIG_STRATEGY",
        help = "The desired strategy for exposing MIG devices: 'none', 'single', or 'mixed'"
    )]
    mig_strategy: Option<String>,

    #[structopt(
        long = "fail-on-init-error",
        env = "FAIL_ON_INIT_ERROR",
        help = "Fail the daemon when device discovery fails; set to false on mixed clusters so the daemon can be deployed uniformly"
    )]
    fail_on_init_error: Option<bool>,

    #[structopt(
        long = "device-list-strategy",
        env = "DEVICE_LIST_STRATEGY",
        help = "Comma-separated strategies for passing the device list to the runtime: envvar, volume-mounts, cdi-annotations, cdi-cri"
    )]
    device_list_strategy: Option<String>,

    #[structopt(
        long = "device-id-strategy",
        env = "DEVICE_ID_STRATEGY",
        help = "The form of device identifier passed to the runtime: 'uuid' or 'index'"
    )]
    device_id_strategy: Option<String>,

    #[structopt(
        long = "pass-device-specs",
        help = "Pass the paths of the device nodes as DeviceSpecs in the allocate response"
    )]
    pass_device_specs: bool,
}

fn apply_overrides(config: &mut Config, opts: &Opts) -> anyhow::Result<()> {
    if let Some(strategy) = &opts.mig_strategy {
        config.mig_strategy = match strategy.as_str() {
            "none" => MigStrategy::None,
            "single" => MigStrategy::Single,
            "mixed" => MigStrategy::Mixed,
            other => anyhow::bail!("unknown MIG strategy: {}", other),
        };
    }
    if let Some(fail) = opts.fail_on_init_error {
        config.fail_on_init_error = fail;
    }
    if let Some(strategies) = &opts.device_list_strategy {
        config.device_list_strategy = strategies
            .split(',')
            .map(|s| match s.trim() {
                "envvar" => Ok(DeviceListStrategy::Envvar),
                "volume-mounts" => Ok(DeviceListStrategy::VolumeMounts),
                "cdi-annotations" => Ok(DeviceListStrategy::CdiAnnotations),
                "cdi-cri" => Ok(DeviceListStrategy::CdiCri),
                other => anyhow::bail!("unknown device list strategy: {}", other),
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
    }
    if let Some(strategy) = &opts.device_id_strategy {
        config.device_id_strategy = match strategy.as_str() {
            "uuid" => DeviceIdStrategy::Uuid,
            "index" => DeviceIdStrategy::Index,
            other => anyhow::bail!("unknown device ID strategy: {}", other),
        };
    }
    if opts.pass_device_specs {
        config.pass_device_specs = true;
    }
    Ok(())
}

async fn run(opts: Opts) -> anyhow::Result<()> {
    let mut config = match &opts.config_file {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &opts)?;
    config.validate()?;

    info!("starting nvidia-device-plugin");
    let provider = Arc::new(nvml::NvmlProvider::new());
    let cdi = Arc::new(StaticCdiHandler::default());
    Supervisor::new(provider, cdi, config, opts.config_file.clone())
        .run()
        .await?;
    info!("nvidia-device-plugin exited cleanly");
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Opts::from_args()).await {
        error!(error = %e, "nvidia-device-plugin failed");
        std::process::exit(1);
    }
}

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tracing::error;

use podyard::agent::{api, seed, Starter};
use podyard::common::{
    AGENT_CONTEXT_PATH, AGENT_LOG_PATH, AGENT_VOLUME_PATH, ENV_DEBUG, ENV_HOST_CONTEXT_PATH,
    ENV_IMAGES, ENV_INSTANCE_NAME, ENV_SESSION_ID,
};
use podyard::event::EventBus;
use podyard::{config, launcher, logging};

#[derive(Parser)]
#[command(name = "podyard")]
#[command(about = "Local pod orchestrator over the Docker daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a compose session: prepare the network and spawn the agent
    Start {
        /// Keep the agent container and follow its logs
        #[arg(long)]
        debug: bool,

        /// Start all pods immediately instead of waiting for POST /start
        #[arg(long = "autoStart", default_value_t = true, action = clap::ArgAction::Set)]
        auto_start: bool,

        /// Write {SessionId, ManagerPort, EventBusPort} JSON to this file
        #[arg(long = "configDumpFile")]
        config_dump_file: Option<String>,

        /// Workspace holding compose.yml, normally $PWD
        #[arg(short, long, default_value = ".")]
        path: String,

        /// Session id; generated when omitted
        #[arg(short, long, default_value = "")]
        name: String,

        /// Image overrides as {"image":{"agent":…,"ingress":…,"pause":…}}
        #[arg(long = "fromConfigJson")]
        from_config_json: Option<String>,
    },

    /// Ask the agents of the given sessions to clean up and exit
    Shutdown {
        #[arg(value_name = "SESSION", required = true)]
        sessions: Vec<String>,
    },

    /// List known sessions and their mapped ports
    Ps,

    /// Remove leftover engine objects; --all ignores live sessions
    Clean {
        #[arg(short, long)]
        all: bool,
    },

    /// Agent-side subcommands (run inside containers, internal use)
    #[command(subcommand)]
    Agent(AgentCommands),
}

#[derive(Subcommand)]
enum AgentCommands {
    /// Serve the control API; the long-lived agent entrypoint
    Serve {
        #[arg(long = "autoStart", default_value_t = true, action = clap::ArgAction::Set)]
        auto_start: bool,
    },

    /// Sweep every engine object of this session
    Clean,

    /// Seed declared volumes from their workspace directories
    #[command(name = "prepareVolume")]
    PrepareVolume,

    /// Seed the volumes of one volume group
    #[command(name = "prepareVolumeGroup")]
    PrepareVolumeGroup {
        #[arg(short = 's', long = "select")]
        select: String,
    },

    /// Write the ingress proxy configuration into its volume
    #[command(name = "prepareIngressVolume")]
    PrepareIngressVolume {
        /// service=src:dst port mappings
        #[arg(short = 'p', long = "ports")]
        ports: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Start {
            debug,
            auto_start,
            config_dump_file,
            path,
            name,
            from_config_json,
        } => {
            logging::init_logging("./logs", "podyard", debug, false);
            let images = from_config_json
                .as_deref()
                .map(config::set_images_from_json)
                .transpose()
                .map_err(Into::into);
            match images {
                Ok(_) => {
                    run_start(&path, &name, auto_start, debug, config_dump_file.as_deref()).await
                }
                Err(e) => Err(e),
            }
        }
        Commands::Shutdown { sessions } => {
            logging::init_logging("./logs", "podyard", false, false);
            launcher::shutdown(&sessions).await.map_err(Into::into)
        }
        Commands::Ps => {
            logging::init_logging("./logs", "podyard", false, false);
            launcher::ps().await.map_err(Into::into)
        }
        Commands::Clean { all } => {
            logging::init_logging("./logs", "podyard", false, false);
            launcher::clean(all).await.map_err(Into::into)
        }
        Commands::Agent(agent_command) => run_agent(agent_command).await,
    };
    handle(result);
}

async fn run_start(
    path: &str,
    name: &str,
    auto_start: bool,
    debug: bool,
    config_dump_file: Option<&str>,
) -> Result<()> {
    let launcher = launcher::Launcher::new(path, name).await?;
    launcher.start(auto_start, debug, config_dump_file).await?;
    Ok(())
}

/// Environment contract of the agent image: session id, host workspace
/// path, debug flag, instance name and image overrides. Everything else is
/// ignored.
async fn run_agent(command: AgentCommands) -> Result<()> {
    let session_id = std::env::var(ENV_SESSION_ID).unwrap_or_default();
    let host_context_path = std::env::var(ENV_HOST_CONTEXT_PATH).unwrap_or_default();
    let debug = !std::env::var(ENV_DEBUG).unwrap_or_default().is_empty();
    let instance = std::env::var(ENV_INSTANCE_NAME).unwrap_or_else(|_| "agent".to_string());
    logging::init_logging(AGENT_LOG_PATH, &instance, debug, true);
    if let Ok(images_json) = std::env::var(ENV_IMAGES) {
        if !images_json.is_empty() {
            config::set_images_from_json(&images_json)?;
        }
    }

    match command {
        AgentCommands::Serve { auto_start } => {
            let starter = Arc::new(
                Starter::new(
                    AGENT_CONTEXT_PATH,
                    &session_id,
                    Some(host_context_path.into()),
                    Arc::new(EventBus::new()),
                )
                .await?,
            );
            api::serve(starter, auto_start).await?;
        }
        AgentCommands::Clean => {
            let provider =
                podyard::docker::DockerProvider::new(Arc::new(EventBus::new())).await?;
            provider.clear_with_session(&session_id).await;
        }
        AgentCommands::PrepareVolume => {
            let config = load_agent_config()?;
            seed::seed_volumes(
                &config.volumes,
                Path::new(AGENT_CONTEXT_PATH),
                Path::new(AGENT_VOLUME_PATH),
            )?;
        }
        AgentCommands::PrepareVolumeGroup { select } => {
            let config = load_agent_config()?;
            seed::seed_volume_group(
                &config,
                &select,
                Path::new(AGENT_CONTEXT_PATH),
                Path::new(AGENT_VOLUME_PATH),
            )?;
        }
        AgentCommands::PrepareIngressVolume { ports } => {
            let mut config = podyard::agent::ingress::EnvoyConfig::new();
            for mapping in &ports {
                let (service, port_pair) = mapping.split_once('=').ok_or_else(|| {
                    anyhow::anyhow!("invalid port mapping {mapping:?}, want service=src:dst")
                })?;
                let (src, dst) = port_pair
                    .split_once(':')
                    .ok_or_else(|| anyhow::anyhow!("invalid port pair {port_pair:?}"))?;
                config.add_expose_port(service, src.parse()?, dst.parse()?)?;
            }
            let target = Path::new(AGENT_VOLUME_PATH)
                .join(podyard::common::INGRESS_VOLUME_NAME)
                .join("envoy.yaml");
            std::fs::write(target, config.to_yaml()?)?;
        }
    }
    Ok(())
}

/// Parse and validate the workspace config the way the serving agent does;
/// worker subcommands share the same document.
fn load_agent_config() -> Result<config::ComposeConfig> {
    let workspace = Path::new(AGENT_CONTEXT_PATH);
    let bytes = std::fs::read(workspace.join(podyard::common::CONFIG_FILE_NAME))?;
    let config: config::ComposeConfig = serde_yaml::from_slice(&bytes)?;
    config.check(workspace)?;
    Ok(config)
}

fn handle<T>(result: Result<T>) {
    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

use std::{env, path::PathBuf, process, sync::Arc};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use flowdesk::{
    apps::{App, Layout, cmd_init},
    channel::{ConsoleTransport, LogTransport},
    config::{ConfigManager, EngineConfig, EnvConfigManager, MapConfigManager},
    directory::{AgentDirectory, InMemoryAgentDirectory},
    external::Resolvers,
    flow::manager::FlowManager,
    flow_commands::{export_flow_file, import_flow_file, validate_flow_file},
    logger::init_tracing,
    router::{AgentAction, Router},
    schema::write_schema,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

const CHAT_CHANNEL: &str = "console";

#[derive(Parser, Debug)]
#[command(
    name = "flowdesk",
    about = "Conversational flow execution and agent routing",
    version = "0.1.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine until Ctrl-C
    Run(RunArgs),

    /// Emit JSON-Schema into `<root>/schemas`
    Schema,

    /// Initialize a fresh layout
    Init,

    /// Manage flow files
    Flow(FlowArgs),

    /// Talk to a flow from the terminal
    Chat(ChatArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Idle timeout in seconds for conversations without a team
    #[arg(long)]
    session_timeout: Option<u64>,
    /// Log level filter (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            session_timeout: None,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Args, Debug)]
struct FlowArgs {
    #[command(subcommand)]
    command: FlowCommands,
}

#[derive(Subcommand, Debug)]
enum FlowCommands {
    /// Check a flow file without publishing it
    Validate { file: PathBuf },
    /// Convert a flow file, e.g. from YAML to JSON
    Export { from: PathBuf, to: PathBuf },
    /// Validate a flow file and copy it into `<root>/flows`
    Import { file: PathBuf },
}

#[derive(Args, Debug)]
struct ChatArgs {
    /// Flow file to chat with; defaults to the flows bound in `<root>/config/channels.yaml`
    #[arg(long)]
    flow: Option<PathBuf>,
    /// Team/agent directory file; defaults to `<root>/config/directory.yaml`
    #[arg(long)]
    directory: Option<PathBuf>,
    #[arg(long, default_value = "me")]
    client: String,
    #[arg(long)]
    session_timeout: Option<u64>,
    #[arg(long, default_value = "warn")]
    log_level: String,
}

/// Resolve the flowdesk root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("FLOWDESK_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./flowdesk")
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let layout = Layout::new(resolve_root_dir());
    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(layout, args).await,
        Commands::Schema => {
            let out_dir = layout.root.join("schemas");
            write_schema(&out_dir)?;
            println!("Schemas written to {}", out_dir.display());
            Ok(())
        }
        Commands::Init => {
            cmd_init(&layout)?;
            println!("Initialized flowdesk layout at {}", layout.root.display());
            Ok(())
        }
        Commands::Flow(flow_args) => match flow_args.command {
            FlowCommands::Validate { file } => {
                let flow = validate_flow_file(&file)?;
                println!("Flow `{}` (version {}) is valid.", flow.id(), flow.version());
                Ok(())
            }
            FlowCommands::Export { from, to } => {
                export_flow_file(&from, &to)?;
                println!("Wrote {}", to.display());
                Ok(())
            }
            FlowCommands::Import { file } => {
                let flow = import_flow_file(&file, &layout.flows_dir())?;
                println!("Flow `{}` imported. A running flowdesk picks it up automatically.", flow.id());
                Ok(())
            }
        },
        Commands::Chat(args) => chat(layout, args).await,
    }
}

async fn run(layout: Layout, args: RunArgs) -> anyhow::Result<()> {
    if !layout.root.exists() {
        bail!(
            "Root directory `{}` does not exist. Please run `flowdesk init` first.",
            layout.root.display()
        );
    }
    let logger = init_tracing(
        layout.root.clone(),
        "logs/flowdesk.log",
        "logs/flowdesk_events.json",
        &args.log_level,
        true,
    )?;
    info!("flowdesk starting up");

    let config = ConfigManager(EnvConfigManager::new(layout.env_file()));
    let mut app = App::new();
    if let Err(e) = app
        .bootstrap(&layout, config, args.session_timeout, Arc::new(LogTransport), logger)
        .await
    {
        error!("Failed to bootstrap flowdesk: {:#}", e);
        process::exit(1);
    }

    info!("flowdesk running; press Ctrl-C to exit");
    tokio::signal::ctrl_c().await?;

    info!("flowdesk shutting down");
    app.shutdown().await;
    println!("Goodbye!");
    Ok(())
}

const CHAT_HELP: &str = "\
type a message to talk to the bot, or:
  /pick N                  choose menu option N
  /accept AGENT TEAM       AGENT takes the next waiting conversation of TEAM
  /claim AGENT             AGENT claims this conversation
  /say AGENT TEXT          AGENT writes to the client
  /close AGENT             AGENT closes this conversation
  /quit";

async fn chat(layout: Layout, args: ChatArgs) -> anyhow::Result<()> {
    init_tracing(
        layout.root.clone(),
        "logs/flowdesk-chat.log",
        "logs/flowdesk-chat_events.json",
        &args.log_level,
        false,
    )?;

    let flows = FlowManager::new();
    match &args.flow {
        Some(file) => {
            let flow = flows.load_file(file)?;
            flows.bind_channel(CHAT_CHANNEL, flow.id())?;
        }
        None => {
            flows.load_all_flows_from_dir(&layout.flows_dir())?;
            flows
                .bind_channels_from_file(&layout.channels_file())
                .context("no --flow given and no channel bindings found; run `flowdesk init`")?;
        }
    }

    let directory_file = args.directory.clone().unwrap_or_else(|| layout.directory_file());
    let directory: Arc<dyn AgentDirectory> = if directory_file.exists() {
        InMemoryAgentDirectory::load_from_file(&directory_file)?
    } else {
        InMemoryAgentDirectory::new()
    };

    let config = if layout.env_file().exists() {
        ConfigManager(EnvConfigManager::new(layout.env_file()))
    } else {
        ConfigManager(MapConfigManager::new())
    };
    let mut engine_config = EngineConfig::load(&config).await;
    if let Some(secs) = args.session_timeout {
        engine_config.session_timeout = std::time::Duration::from_secs(secs);
    }

    let router = Router::new(
        flows,
        directory,
        Arc::new(ConsoleTransport),
        Arc::new(Resolvers::builtin()),
        engine_config,
    );

    println!("{CHAT_HELP}");
    let mut current: Option<String> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match chat_line(&router, &args.client, line, &mut current).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("! {e:#}"),
        }
    }
    if let Some(id) = current {
        router.close(&id).await?;
    }
    Ok(())
}

fn open(current: &Option<String>) -> anyhow::Result<String> {
    current.clone().context("no conversation yet; say something first")
}

// false once the user asked to leave
async fn chat_line(
    router: &Router,
    client: &str,
    line: &str,
    current: &mut Option<String>,
) -> anyhow::Result<bool> {
    let mut words = line.splitn(3, ' ');
    match words.next().unwrap_or_default() {
        "/quit" => return Ok(false),
        "/help" => println!("{CHAT_HELP}"),
        "/pick" => {
            let n: usize = words.next().unwrap_or_default().parse().context("/pick needs a number")?;
            if n == 0 {
                bail!("options are numbered from 1");
            }
            let ack = router.post_menu_selection(CHAT_CHANNEL, client, n - 1).await?;
            *current = Some(ack.conversation_id);
        }
        "/accept" => {
            let (Some(agent), Some(team)) = (words.next(), words.next()) else {
                bail!("usage: /accept AGENT TEAM");
            };
            match router.accept_next(agent, team).await? {
                Some(id) => println!("  {agent} took {id}"),
                None => println!("  nobody is waiting for {team}"),
            }
        }
        "/claim" => {
            let agent = words.next().context("usage: /claim AGENT")?;
            let status = router.agent_action(agent, &open(current)?, AgentAction::Claim).await?;
            println!("  now {status:?}");
        }
        "/say" => {
            let (Some(agent), Some(text)) = (words.next(), words.next()) else {
                bail!("usage: /say AGENT TEXT");
            };
            router
                .agent_action(agent, &open(current)?, AgentAction::Send(text.to_string()))
                .await?;
        }
        "/close" => {
            let agent = words.next().context("usage: /close AGENT")?;
            router.agent_action(agent, &open(current)?, AgentAction::Close).await?;
        }
        _ => {
            let ack = router.post_client_message(CHAT_CHANNEL, client, line).await?;
            *current = Some(ack.conversation_id);
        }
    }
    Ok(true)
}

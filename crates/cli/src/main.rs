use clap::{Parser, Subcommand};
use clawgate::backend::{BackendRequest, OllamaBackend, ReasoningBackend};
use clawgate::config;
use clawgate::message::Channel;

#[derive(Parser)]
#[command(name = "clawgate")]
#[command(about = "Clawgate channel gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the gateway: webhook endpoints for enabled channels, dispatcher workers, scheduler and heartbeat.
    Gateway {
        /// Config file path (default: CLAWGATE_CONFIG_PATH or ~/.clawgate/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP port (default from config or 15151)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Talk to the reasoning backend directly. With -m sends one message; otherwise starts a REPL.
    Agent {
        /// Config file path (default: CLAWGATE_CONFIG_PATH or ~/.clawgate/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Single message to send
        #[arg(long, short)]
        message: Option<String>,
    },

    /// Show resolved configuration: paths, model, channels, skills and memory.
    Status {
        /// Config file path (default: CLAWGATE_CONFIG_PATH or ~/.clawgate/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("clawgate {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Agent { config, message }) => {
            if let Err(e) = run_agent(config, message).await {
                log::error!("agent failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Status { config }) => {
            if let Err(e) = run_status(config) {
                log::error!("status failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    clawgate::gateway::run_gateway(config, path).await
}

async fn run_agent(
    config_path: Option<std::path::PathBuf>,
    message: Option<String>,
) -> anyhow::Result<()> {
    use std::io::{self, Write};

    let (config, _) = config::load_config(config_path)?;
    let backend = OllamaBackend::from_config(&config);

    if let Some(text) = message {
        let res = backend
            .run(BackendRequest {
                prompt: text,
                session_id: "cli".to_string(),
            })
            .await?;
        println!("{}", res.output.trim());
        return Ok(());
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            break;
        }
        match backend
            .run(BackendRequest {
                prompt: input.to_string(),
                session_id: "cli-repl".to_string(),
            })
            .await
        {
            Ok(res) => println!("< {}", res.output.trim()),
            Err(e) => eprintln!("agent error: {}", e),
        }
    }
    backend.close().await;
    Ok(())
}

fn run_status(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (cfg, path) = config::load_config(config_path)?;
    let workspace = config::resolve_workspace_dir(&cfg);
    println!("config:    {}{}", path.display(), if path.exists() { "" } else { " (missing, defaults)" });
    println!(
        "workspace: {}",
        workspace
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!(
        "backend:   {} model {}",
        config::resolve_backend_url(&cfg).unwrap_or_else(|| "http://127.0.0.1:11434".to_string()),
        cfg.agents.default_model.as_deref().unwrap_or("(default)")
    );
    println!("listen:    {}:{}", cfg.gateway.bind, cfg.gateway.port);
    for ch in Channel::ALL {
        let enabled = match ch {
            Channel::Telegram => cfg.channels.telegram.enabled,
            Channel::Feishu => cfg.channels.feishu.enabled,
            Channel::WeCom => cfg.channels.wecom.enabled,
        };
        println!("channel:   {:<9}{}", ch.as_str(), if enabled { "enabled" } else { "disabled" });
    }
    let skills = clawgate::backend::load_configured_skills(&cfg);
    println!("skills:    {}", skills.len());
    for s in &skills {
        println!("  - {}: {}", s.name, s.description);
    }
    let memory = clawgate::prompt::load_memory_context(workspace.as_deref());
    println!(
        "memory:    {}",
        memory
            .map(|m| format!("{} chars", m.chars().count()))
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!("cron jobs: {}", cfg.cron.len());
    Ok(())
}

use clap::{Parser, Subcommand};
use lib::adapter::Speaker;
use lib::channels::{AmqpSource, QueueSource};
use lib::session::{ChatSession, Route};
use lib::transcript::{SpeakerNames, TranscriptChange};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(about = "Terminal chat over HTTP, WebSocket and a message queue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Write the default configuration file if it does not exist.
    Init {
        /// Config file path (default: CHATRELAY_CONFIG_PATH or ~/.chatrelay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Interactive chat. Replies from the queue consumer are shown as they arrive.
    Chat {
        /// Config file path (default: CHATRELAY_CONFIG_PATH or ~/.chatrelay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Channel for submissions: http or socket.
        #[arg(long, default_value = "http")]
        via: Route,

        /// Do not start the queue consumer.
        #[arg(long)]
        no_queue: bool,

        /// Override the configured user id.
        #[arg(long, value_name = "ID")]
        user: Option<String>,

        /// Override the configured model id.
        #[arg(long, value_name = "ID")]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("chatrelay {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            config,
            via,
            no_queue,
            user,
            model,
        }) => {
            if let Err(e) = run_chat(config, via, no_queue, user, model).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    if lib::config::init_config(&path)? {
        println!("wrote default configuration to {}", path.display());
    } else {
        println!("configuration already exists at {}", path.display());
    }
    Ok(())
}

async fn run_chat(
    config_path: Option<PathBuf>,
    via: Route,
    no_queue: bool,
    user: Option<String>,
    model: Option<String>,
) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    log::info!("using config {}", path.display());
    if let Some(user) = user {
        config.identity.user_id = user;
    }
    if let Some(model) = model {
        config.identity.model_id = model;
    }

    let mut session = ChatSession::new(&config)?;
    let printer = tokio::spawn(print_changes(
        session.transcript().subscribe(),
        session.speaker_names(),
    ));

    let queue: Option<Arc<dyn QueueSource>> = if config.broker.enabled && !no_queue {
        Some(Arc::new(AmqpSource::new(&config)))
    } else {
        None
    };
    session.start(queue).await;
    println!(
        "chatting as {} via {:?}; /quit to leave, /clear, /export <path>, /agent <name>, /status",
        session.identity().user_id,
        via
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        if input.eq_ignore_ascii_case("/clear") {
            session.transcript().clear().await;
            continue;
        }
        if input.eq_ignore_ascii_case("/status") {
            let status = session.status().await;
            println!(
                "socket: {} (session {}), queue: {}, lines: {}",
                if status.socket_connected { "connected" } else { "disconnected" },
                status.socket_session_id.as_deref().unwrap_or("none"),
                match status.queue_dormant {
                    None => "off",
                    Some(true) => "dormant",
                    Some(false) => "running",
                },
                status.transcript_len
            );
            continue;
        }
        if let Some(rest) = input.strip_prefix("/export") {
            if let Err(e) = export(&session, rest.trim()).await {
                eprintln!("export failed: {}", e);
            }
            continue;
        }
        if let Some(agent) = input.strip_prefix("/agent") {
            let agent = agent.trim();
            if agent.is_empty() {
                eprintln!("usage: /agent <name>");
            } else {
                session.switch_agent(agent).await;
            }
            continue;
        }
        session.submit(input, via).await;
    }

    session.shutdown().await;
    printer.abort();
    Ok(())
}

async fn export(session: &ChatSession, target: &str) -> anyhow::Result<()> {
    if target.is_empty() {
        anyhow::bail!("usage: /export <path>");
    }
    let path = PathBuf::from(target);
    let body = if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json")) {
        session.transcript().export_json().await?
    } else {
        session.transcript().export_text(&session.speaker_names()).await
    };
    tokio::fs::write(&path, body).await?;
    println!("transcript written to {}", path.display());
    Ok(())
}

/// Render transcript changes to stdout. The user's own lines are already on screen.
async fn print_changes(
    mut changes: tokio::sync::broadcast::Receiver<TranscriptChange>,
    names: SpeakerNames,
) {
    loop {
        match changes.recv().await {
            Ok(TranscriptChange::Appended(entry)) => {
                if matches!(entry.event.speaker, Speaker::User(_)) {
                    continue;
                }
                if entry.transient {
                    println!("  … {}", entry.event.text);
                } else {
                    println!("< {}: {}", names.label(&entry.event.speaker), entry.event.text);
                }
            }
            Ok(TranscriptChange::Removed(_)) => {}
            Ok(TranscriptChange::Cleared) => println!("(transcript cleared)"),
            Err(RecvError::Lagged(n)) => log::warn!("printer fell behind by {} changes", n),
            Err(RecvError::Closed) => break,
        }
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use run_relay_agent::{ScriptedSource, StepSource};
use run_relay_client::{
    run_client, ClientEvent, ClientOptions, ClientSession, EntryState, SessionEvent, Surfaces,
};
use run_relay_core::config::{Config, LoggingConfig};
use run_relay_core::protocol::ClientCommand;

mod terminal;

use terminal::TerminalSurface;

#[derive(Parser)]
#[command(
    name = "run-relay",
    about = "Stream agent runs to every observer and reconcile them into a stable transcript",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway with a scripted step source
    Serve {
        /// Port to listen on (default: 18790)
        #[arg(long)]
        port: Option<u16>,

        /// Step script (JSON array or JSON lines); the built-in demo if omitted
        #[arg(long)]
        script: Option<PathBuf>,

        /// Delay between scripted events in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
    },

    /// Observe a session and print its transcript
    Watch {
        session: String,

        /// Gateway URL (default from config)
        #[arg(long)]
        url: Option<String>,
    },

    /// Submit a query and watch the run until it finishes
    Ask {
        query: String,

        /// Existing session to use; a new one is created if omitted
        #[arg(long)]
        session: Option<String>,

        /// Gateway URL (default from config)
        #[arg(long)]
        url: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let level = if verbose {
        "debug".to_string()
    } else {
        logging
            .and_then(|l| l.level.clone())
            .unwrap_or_else(|| "info".to_string())
    };
    let directives = std::iter::once(level)
        .chain(logging.map(|l| l.filters.clone()).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(",");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    let writer = match logging.map(|l| l.output.as_str()) {
        Some("stdout") => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };

    if logging.is_some_and(|l| l.format == "json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);

    let config = Config::load(&config_path)?;
    init_logging(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Serve {
            port,
            script,
            delay_ms,
        } => {
            let port = port.unwrap_or_else(|| config.gateway_port());
            let mut source = match &script {
                Some(path) => ScriptedSource::from_path(path)?.with_simulated_streaming(true),
                None => ScriptedSource::demo(),
            };
            if let Some(ms) = delay_ms {
                source = source.with_delay(Duration::from_millis(ms));
            }
            tracing::info!(
                steps = source.events().len(),
                script = ?script,
                "Starting Run Relay gateway on port {port}"
            );

            let source: Arc<dyn StepSource> = Arc::new(source);
            let state = Arc::new(run_relay_gateway::GatewayState::new(
                Arc::new(config),
                source,
            ));
            run_relay_gateway::start_gateway(state, port).await?;
        }
        Commands::Watch { session, url } => {
            let options = client_options(&config, url, session);
            observe(options, None).await?;
        }
        Commands::Ask {
            query,
            session,
            url,
        } => {
            let session = match session {
                Some(s) => s,
                None => {
                    let base = url.clone().unwrap_or_else(|| config.client_url());
                    create_session(&base).await?
                }
            };
            println!("session: {session}");
            let options = client_options(&config, url, session);
            observe(options, Some(query)).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} config error(s)", errors.len());
                }
                println!("Config OK ({})", config_path.display());
            }
        },
    }

    Ok(())
}

fn client_options(config: &Config, url: Option<String>, session: String) -> ClientOptions {
    let mut options = ClientOptions::from_config(config, session);
    if let Some(url) = url {
        options.url = url;
    }
    options
}

/// `POST /sessions` on the gateway's HTTP side.
async fn create_session(ws_url: &str) -> anyhow::Result<String> {
    let http = ws_url
        .replacen("ws://", "http://", 1)
        .replacen("wss://", "https://", 1);
    let endpoint = format!("{}/sessions", http.trim_end_matches('/'));
    let body: serde_json::Value = reqwest::Client::new()
        .post(&endpoint)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    body.get("session_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Gateway returned no session_id"))
}

/// Render every settled entry. A user query settles entries other than the
/// one it touched, so the whole transcript is offered; surfaces skip repeats.
fn render_settled(session: &ClientSession, surfaces: &mut Surfaces) {
    for entry in session.transcript() {
        if entry.state == EntryState::Settled {
            surfaces.dispatch(&entry.display_id, &entry.message);
        }
    }
}

/// Connect, print settled entries as they arrive, and optionally drive one query.
///
/// With a query, returns once the run reaches `done` or `error`; Ctrl+C asks the
/// gateway to cancel. Without one, runs until Ctrl+C.
async fn observe(options: ClientOptions, query: Option<String>) -> anyhow::Result<()> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let client = tokio::spawn(run_client(options, cmd_rx, ev_tx, cancel.clone()));

    let mut session = ClientSession::new();
    let mut surfaces = Surfaces::new(
        Box::new(TerminalSurface::new("chat")),
        Box::new(TerminalSurface::new("code")),
        Box::new(TerminalSurface::new("log")),
    );
    let mut pending_query = query;
    let asking = pending_query.is_some();
    let mut submitted = false;
    let mut run_seen = false;
    let mut cancel_requested = false;
    let mut last_status = session.status();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if submitted && !cancel_requested {
                    tracing::info!("Cancelling run");
                    let _ = cmd_tx.send(ClientCommand::Cancel);
                    cancel_requested = true;
                    continue;
                }
                break;
            }
            event = ev_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    ClientEvent::Connected => session.begin_resync(),
                    ClientEvent::Disconnected { reason } => {
                        tracing::warn!(%reason, "Disconnected, reconnecting");
                    }
                    ClientEvent::Frame(frame) => match session.handle_frame(frame) {
                        SessionEvent::Message { outcome, .. } if outcome.changed() => {
                            render_settled(&session, &mut surfaces);
                        }
                        SessionEvent::Resynced { .. } => {
                            surfaces.clear();
                            render_settled(&session, &mut surfaces);
                            if let Some(query) = pending_query.take() {
                                cmd_tx.send(ClientCommand::Query { query })?;
                                submitted = true;
                            }
                        }
                        SessionEvent::Error(message) => {
                            eprintln!("error: {message}");
                            if asking {
                                break;
                            }
                        }
                        _ => {}
                    },
                }

                let status = session.status();
                if status != last_status {
                    tracing::info!(%status, "Agent status");
                    last_status = status;
                }
                // The previous run's terminal status lingers until our query echoes back.
                if submitted && !status.is_terminal() {
                    run_seen = true;
                }
                if run_seen && status.is_terminal() {
                    break;
                }
            }
        }
    }

    cancel.cancel();
    client.await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use run_relay_core::message::{MessageMetadata, MessageType, Role, RunMessage};

    #[test]
    fn test_client_options_url_override() {
        let options = client_options(
            &Config::default(),
            Some("ws://relay:9000".into()),
            "s1".into(),
        );
        assert_eq!(options.session_url(), "ws://relay:9000/ws/s1");
    }

    struct Recording(Arc<std::sync::Mutex<Vec<String>>>);

    impl run_relay_client::DisplaySurface for Recording {
        fn render(&mut self, display_id: &str, _: &RunMessage, _: &run_relay_client::View) {
            self.0.lock().unwrap().push(display_id.to_string());
        }

        fn clear(&mut self) {}
    }

    #[test]
    fn test_user_query_renders_entries_it_settles() {
        let chat = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut surfaces = Surfaces::new(
            Box::new(Recording(chat.clone())),
            Box::new(Recording(Arc::default())),
            Box::new(Recording(Arc::default())),
        );
        let mut session = ClientSession::new();

        let mut metadata = MessageMetadata::of_type(MessageType::ActionThought);
        metadata.streaming = true;
        let mut thought = RunMessage::new("s1", 1, Role::Assistant, "Searching", metadata);
        thought.message_id = "m1".into();
        session.apply(&thought);
        render_settled(&session, &mut surfaces);
        assert!(chat.lock().unwrap().is_empty());

        let mut query = RunMessage::new(
            "s1",
            1,
            Role::User,
            "And Germany?",
            MessageMetadata::of_type(MessageType::UserQuery),
        );
        query.message_id = "q2".into();
        session.apply(&query);
        render_settled(&session, &mut surfaces);
        assert_eq!(*chat.lock().unwrap(), vec!["m1".to_string(), "q2".to_string()]);
    }

    #[test]
    fn test_cli_parses_serve() {
        let cli = Cli::parse_from(["run-relay", "serve", "--port", "9999", "--delay-ms", "0"]);
        match cli.command {
            Commands::Serve { port, delay_ms, .. } => {
                assert_eq!(port, Some(9999));
                assert_eq!(delay_ms, Some(0));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_cli_parses_ask_with_session() {
        let cli = Cli::parse_from(["run-relay", "ask", "capital of France?", "--session", "abc"]);
        match cli.command {
            Commands::Ask { query, session, url } => {
                assert_eq!(query, "capital of France?");
                assert_eq!(session.as_deref(), Some("abc"));
                assert!(url.is_none());
            }
            _ => panic!("expected ask"),
        }
    }
}

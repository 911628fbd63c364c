//! Opwatch CLI - follows generation progress from the terminal.
//!
//! This is the binary entry point; all protocol and state-machine content
//! lives in the `opwatch` library. The CLI is view glue: it triggers
//! operations over HTTP and renders the event stream as console lines.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use opwatch::{Config, ProgressEvent, ProgressWatcher, TerminalNotice, TriggerClient, Visibility};

/// Global allocator; mimalloc outperforms the system allocator under the
/// multi-threaded runtime.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Realtime progress watcher for long-running generation operations.
#[derive(Parser)]
#[command(name = "opwatch", version)]
struct Cli {
    /// Server base URL (overrides the config file and OPWATCH_SERVER_URL).
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Watch progress events for a user.
    Watch {
        /// User identity to observe.
        #[arg(long)]
        user: String,
        /// Only report status and notices for this operation.
        #[arg(long)]
        operation: Option<String>,
    },
    /// Start a generation, then follow it to completion.
    Trigger {
        /// User to start the generation for.
        #[arg(long)]
        user: String,
        /// Print the operation id and exit instead of following.
        #[arg(long)]
        no_follow: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }

    match cli.command {
        Commands::Watch { user, operation } => run_watch(&config, &user, operation).await,
        Commands::Trigger { user, no_follow } => {
            let client = TriggerClient::new(&config.server_url);
            let operation_id = client.start_generation(&user).await?;
            println!("Started operation {operation_id} for {user}");
            if no_follow {
                return Ok(());
            }
            run_watch(&config, &user, Some(operation_id)).await
        }
    }
}

/// Observe a user and print events, state changes, and terminal notices
/// until Ctrl-C (or, when following one operation, until it finishes).
async fn run_watch(config: &Config, user: &str, operation: Option<String>) -> Result<()> {
    let mut watcher = ProgressWatcher::new(config.connection());
    watcher.observe(user);
    watcher.set_operation(operation.as_deref());

    let mut store_rx = watcher.store_changes().context("watcher has no session")?;
    let mut state_rx = watcher.state_changes().context("watcher has no session")?;

    let follow_one = watcher.operation_id().is_some();
    println!("Watching progress for {user} -- Ctrl-C to stop");

    let mut printed = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                println!("-- {state}");
            }

            changed = store_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                store_rx.borrow_and_update();
                let events = watcher.events();
                if events.len() < printed {
                    // Store was cleared
                    printed = 0;
                }
                for event in &events[printed..] {
                    println!("{}", render_event(event));
                }
                printed = events.len();

                if let Some(notice) = watcher.take_terminal_notice() {
                    match notice {
                        TerminalNotice::Success(message) => println!("ok: {message}"),
                        TerminalNotice::Failure(message) => println!("FAILED: {message}"),
                    }
                    if follow_one {
                        break;
                    }
                }
            }
        }
    }

    watcher.stop();
    Ok(())
}

/// One console line per event. Percentage defaults to 0% for display;
/// public broadcasts render without one.
fn render_event(event: &ProgressEvent) -> String {
    let time = event.timestamp.format("%H:%M:%S");
    match event.visibility {
        Visibility::Private => {
            let step = event
                .step
                .as_deref()
                .map(|s| format!("{s}: "))
                .unwrap_or_default();
            format!(
                "[{time}] {:>3}% {step}{}",
                event.display_percentage(),
                event.message
            )
        }
        Visibility::Public => format!("[{time}] (system) {}", event.message),
    }
}

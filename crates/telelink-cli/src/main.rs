//! `telelink` – operator console for a telepresence robot.
//!
//! 1. Initialises tracing (optionally exporting spans over OTLP).
//! 2. Loads `~/.telelink/config.toml`, falling back to defaults.
//! 3. Builds the event hub, connection registry and navigation session.
//! 4. Prints link, mode and navigation events as they arrive.
//! 5. Runs the slash-command console until `/quit` or EOF.
//! 6. On **Ctrl-C** sends an emergency stop and exits.

mod config;
mod console;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use telelink_middleware::{ConnectionRegistry, EventHub, NavigationClient, NavigationSession};
use telelink_types::{ConnectionStatus, Event, EventPayload};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::console::Console;

fn main() {
    let _guard = telemetry::init_tracing("telelink");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };
    debug!(config = ?cfg, "configuration");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            return;
        }
    };
    runtime.block_on(run(cfg));
    // Stdin reads park a blocking thread; do not wait on it.
    runtime.shutdown_timeout(Duration::from_millis(200));
}

async fn run(cfg: config::Config) {
    let link_config = cfg.link_config();
    let schema = cfg.command_schema();
    drop(cfg);

    let hub = EventHub::default();
    let registry =
        Arc::new(ConnectionRegistry::new(link_config.clone(), hub.clone()).with_schema(schema));
    let client = match NavigationClient::http(link_config.navigation.clone(), hub.clone()) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to build the navigation client");
            return;
        }
    };
    let navigation = Arc::new(NavigationSession::new(client, Arc::clone(&registry)));

    let observer = tokio::spawn(observe(hub.subscribe()));

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let (interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();
    if let Err(e) = ctrlc::set_handler(move || {
        if interrupt_tx.send(()).is_err() {
            std::process::exit(130);
        }
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; Ctrl-C will not send an emergency stop");
    }

    println!();
    println!(
        "  Robot socket {}  bus {}  navigation {}",
        link_config.transport.url.dimmed(),
        link_config.bus.url.dimmed(),
        link_config.navigation.base_url.dimmed()
    );
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    Console::new(registry, navigation).run(interrupt_rx).await;
    observer.abort();
    println!("{}", "  ✓ Exiting telelink.".green());
}

/// Print the events an operator cares about as they arrive.
async fn observe(mut events: broadcast::Receiver<Event>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "console observer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event.payload {
            EventPayload::Status { link, status } => {
                let status = match status {
                    ConnectionStatus::Connected => status.to_string().green(),
                    ConnectionStatus::Error => status.to_string().red(),
                    _ => status.to_string().yellow(),
                };
                println!("\n  [{}] {}", link.to_string().bold(), status);
            }
            EventPayload::ModeChanged {
                previous,
                current,
                event,
            } => println!(
                "\n  [mode] {} → {} ({})",
                previous,
                current.to_string().bold(),
                event
            ),
            EventPayload::Arrived(target) => println!(
                "\n  [navigation] {} ({:.2}, {:.2}) {}",
                "arrived".green().bold(),
                target.x,
                target.y,
                target.label.unwrap_or_default()
            ),
            EventPayload::Chat(payload) => println!("\n  [chat] {}", payload),
            EventPayload::BusMessage { topic, payload } => {
                println!("\n  [bus] {} {}", topic.cyan(), payload.dimmed())
            }
            EventPayload::Telemetry(_) | EventPayload::Pose(_) | EventPayload::Obstacles(_) => {
                debug!(source = %event.source, "stream event");
            }
        }
    }
}

fn print_banner() {
    println!();
    println!("{}", r#"  _       _      _ _       _    "#.bold().cyan());
    println!("{}", r#" | |_ ___| | ___| (_)_ __ | | __"#.bold().cyan());
    println!("{}", r#" | __/ _ \ |/ _ \ | | '_ \| |/ /"#.bold().cyan());
    println!("{}", r#" | ||  __/ |  __/ | | | | |   < "#.bold().cyan());
    println!("{}", r#"  \__\___|_|\___|_|_|_| |_|_|\_\"#.bold().cyan());
    println!();
    println!("  {}", "Telepresence robot link console".dimmed());
}

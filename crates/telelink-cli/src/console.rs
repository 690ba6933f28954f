//! Operator console: slash-commands read from stdin.
//!
//!   /connect [url]          – open the command socket and start navigation
//!   /disconnect             – close every link
//!   /bus [url]              – connect the message bus
//!   /publish cat cmd [json] – publish a bus command
//!   /move angle speed rot   – drive
//!   /stop                   – emergency stop
//!   /say text               – chat line
//!   /voice text             – voice command
//!   /goto x y [label]       – navigate to a map coordinate
//!   /cancel                 – cancel navigation
//!   /mode event             – fire an operating-mode event
//!   /status                 – link, mode and telemetry summary
//!   /help                   – this list
//!   /quit | /exit           – disconnect and exit

use std::io::Write;
use std::sync::Arc;

use colored::Colorize;
use serde_json::Value;
use telelink_middleware::{ConnectionRegistry, NavigationSession, Strategy};
use telelink_types::{ConnectionStatus, ModeEvent, NavTarget, OutboundCommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Connect(Option<String>),
    Disconnect,
    Bus(Option<String>),
    Publish {
        category: String,
        cmd: String,
        params: Option<Value>,
    },
    Send(OutboundCommand),
    GoTo(NavTarget),
    Cancel,
    Mode(ModeEvent),
    Status,
    Help,
    Quit,
}

fn number(word: Option<&str>, name: &str) -> Result<f64, String> {
    let word = word.ok_or_else(|| format!("missing {name}"))?;
    word.parse::<f64>()
        .map_err(|_| format!("{name} must be a number, got '{word}'"))
}

fn rest_of(line: &str, name: &str) -> Result<String, String> {
    let text = line.trim();
    if text.is_empty() {
        Err(format!("missing {name}"))
    } else {
        Ok(text.to_string())
    }
}

/// Parse one console line. Blank lines are the caller's business.
pub fn parse(line: &str) -> Result<ConsoleCommand, String> {
    let line = line.trim();
    let (head, tail) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let mut words = tail.split_whitespace();
    let optional = |w: Option<&str>| w.map(str::to_owned);

    let command = match head {
        "/connect" => ConsoleCommand::Connect(optional(words.next())),
        "/disconnect" => ConsoleCommand::Disconnect,
        "/bus" => ConsoleCommand::Bus(optional(words.next())),
        "/publish" => {
            let category = words.next().ok_or("missing category")?.to_string();
            let cmd = words.next().ok_or("missing cmd")?.to_string();
            let json = words.collect::<Vec<_>>().join(" ");
            let params = if json.is_empty() {
                None
            } else {
                Some(serde_json::from_str(&json).map_err(|e| format!("params: {e}"))?)
            };
            ConsoleCommand::Publish {
                category,
                cmd,
                params,
            }
        }
        "/move" => ConsoleCommand::Send(OutboundCommand::Move {
            angle: number(words.next(), "angle")?,
            speed: number(words.next(), "speed")?,
            rotation: number(words.next(), "rotation")?,
        }),
        "/stop" => ConsoleCommand::Send(OutboundCommand::EmergencyStop),
        "/say" => ConsoleCommand::Send(OutboundCommand::Chat {
            command: rest_of(tail, "text")?,
        }),
        "/voice" => ConsoleCommand::Send(OutboundCommand::VoiceCommand {
            command: rest_of(tail, "text")?,
        }),
        "/goto" => {
            let target = NavTarget::new(number(words.next(), "x")?, number(words.next(), "y")?);
            let label = words.collect::<Vec<_>>().join(" ");
            ConsoleCommand::GoTo(if label.is_empty() {
                target
            } else {
                target.with_label(label)
            })
        }
        "/cancel" => ConsoleCommand::Cancel,
        "/mode" => ConsoleCommand::Mode(words.next().ok_or("missing event")?.parse()?),
        "/status" => ConsoleCommand::Status,
        "/help" => ConsoleCommand::Help,
        "/quit" | "/exit" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(command)
}

/// Executes console commands against the process's links.
pub struct Console {
    registry: Arc<ConnectionRegistry>,
    navigation: Arc<NavigationSession>,
}

impl Console {
    pub fn new(registry: Arc<ConnectionRegistry>, navigation: Arc<NavigationSession>) -> Self {
        Self {
            registry,
            navigation,
        }
    }

    /// Read stdin until `/quit`, EOF, or a message on `interrupt`.
    pub async fn run(&self, mut interrupt: mpsc::UnboundedReceiver<()>) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            prompt();
            let line = tokio::select! {
                Some(()) = interrupt.recv() => {
                    self.emergency_stop();
                    break;
                }
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    eprintln!("{}: {}", "Read error".red(), e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse(&line) {
                Ok(ConsoleCommand::Quit) => {
                    println!("{}", "Goodbye.".green());
                    break;
                }
                Ok(command) => self.execute(command).await,
                Err(e) => println!(
                    "{} {}. Type {} for available commands.",
                    "Error:".red(),
                    e,
                    "/help".bold()
                ),
            }
        }
        self.navigation.stop();
        self.registry.shutdown();
    }

    /// Send an emergency stop over whatever socket is up.
    pub fn emergency_stop(&self) {
        println!();
        println!("{}", "⚠  Interrupted – sending emergency stop …".yellow().bold());
        match self.registry.send(&OutboundCommand::EmergencyStop) {
            Ok(()) => println!("{}", "  ✓ Emergency stop sent.".green()),
            Err(e) => {
                warn!(error = %e, "emergency stop not delivered");
                println!("  {} {}", "✗ Emergency stop not delivered:".red(), e);
            }
        }
    }

    pub async fn execute(&self, command: ConsoleCommand) {
        match command {
            ConsoleCommand::Connect(url) => {
                let url = url.unwrap_or_else(|| self.registry.config().transport.url.clone());
                self.registry.connect_transport(&url);
                println!("  Connecting to {} …", url.bold());
                match self.navigation.start().await {
                    Ok(Strategy::Push) => println!("  Navigation: {}", "push".green()),
                    Ok(Strategy::Poll) => println!("  Navigation: {}", "polling".yellow()),
                    Err(e) => println!("  Navigation: {} ({})", "unavailable".red(), e),
                }
            }
            ConsoleCommand::Disconnect => {
                self.navigation.stop();
                self.registry.shutdown();
                println!("  {}", "Disconnected.".green());
            }
            ConsoleCommand::Bus(url) => {
                let url = url.unwrap_or_else(|| self.registry.config().bus.url.clone());
                match self.registry.connect_bus(&url).await {
                    Ok(()) => println!("  Bus connected to {}", url.bold()),
                    Err(e) => println!("  {} {}", "Bus connect failed:".red(), e),
                }
            }
            ConsoleCommand::Publish {
                category,
                cmd,
                params,
            } => report(self.registry.publish_command(&category, &cmd, params)),
            ConsoleCommand::Send(cmd) => {
                info!(kind = cmd.type_tag(), "operator command");
                report(self.registry.send(&cmd));
            }
            ConsoleCommand::GoTo(target) => report(self.navigation.go_to(target).await),
            ConsoleCommand::Cancel => report(self.navigation.cancel().await),
            ConsoleCommand::Mode(event) => match self.registry.dispatch(event) {
                Ok(t) => println!("  Mode {} → {}", t.previous, t.next.to_string().bold()),
                Err(e) => println!("  {} {}", "Rejected:".red(), e),
            },
            ConsoleCommand::Status => self.print_status(),
            ConsoleCommand::Help => print_help(),
            ConsoleCommand::Quit => {}
        }
    }

    fn print_status(&self) {
        let transport = self.registry.transport_status();
        let retries = self
            .registry
            .transport_retry()
            .map_or(0, |state| state.attempts);
        println!("  Transport   : {} (retries {})", paint(transport), retries);
        println!("  Bus         : {}", paint(self.registry.bus_status()));
        let strategy = match self.navigation.client().strategy() {
            Some(Strategy::Push) => "push",
            Some(Strategy::Poll) => "poll",
            None => "-",
        };
        println!(
            "  Navigation  : {} ({})",
            paint(self.navigation.status()),
            strategy
        );
        println!("  Mode        : {}", self.registry.mode().to_string().bold());
        let events: Vec<_> = self
            .registry
            .available_events()
            .iter()
            .map(ModeEvent::to_string)
            .collect();
        println!("  Events      : {}", events.join(", "));
        if let Some(pose) = self.navigation.pose() {
            println!("  Pose        : ({:.2}, {:.2}) θ {:.2}", pose.x, pose.y, pose.theta);
        }
        if let Some(target) = self.navigation.target() {
            println!(
                "  Target      : ({:.2}, {:.2}) {}",
                target.x,
                target.y,
                target.label.unwrap_or_default()
            );
        }
        let telemetry = self.registry.telemetry();
        if !telemetry.is_empty() {
            match serde_json::to_string(&telemetry) {
                Ok(json) => println!("  Telemetry   : {}", json.dimmed()),
                Err(e) => warn!(error = %e, "telemetry not printable"),
            }
        }
    }
}

fn paint(status: ConnectionStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        ConnectionStatus::Connected => text.green(),
        ConnectionStatus::Connecting => text.yellow(),
        ConnectionStatus::Disconnected => text.dimmed(),
        ConnectionStatus::Error => text.red(),
    }
}

fn report<E: std::fmt::Display>(result: Result<(), E>) {
    match result {
        Ok(()) => println!("  {}", "✓".green()),
        Err(e) => println!("  {} {}", "✗".red(), e),
    }
}

fn prompt() {
    print!("{} ", "telelink>".bold().cyan());
    std::io::stdout().flush().ok();
}

pub fn print_help() {
    println!();
    println!("  {}", "Available commands:".bold());
    let rows = [
        ("/connect [url]", "Open the command socket and start navigation"),
        ("/disconnect", "Close every link"),
        ("/bus [url]", "Connect the message bus"),
        ("/publish cat cmd [json]", "Publish a command on the bus"),
        ("/move angle speed rot", "Drive (angle 0..360, speed/rot -100..100)"),
        ("/stop", "Emergency stop"),
        ("/say text", "Send a chat line"),
        ("/voice text", "Send a voice command"),
        ("/goto x y [label]", "Navigate to a map coordinate"),
        ("/cancel", "Cancel navigation"),
        ("/mode event", "Fire an operating-mode event"),
        ("/status", "Show links, mode and telemetry"),
        ("/help", "Show this list"),
        ("/quit", "Disconnect and exit"),
    ];
    for (cmd, what) in rows {
        println!("    {:<26} {}", cmd.cyan(), what);
    }
    println!();
}

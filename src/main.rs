mod config;
mod error;
mod escalation;
mod fleet;
mod logging;
mod remote;
mod resolve;
mod table;

use crate::config::Config;
use crate::error::{EXIT_OK, EXIT_PARTIAL, ResolveError, exit_code_for};
use crate::escalation::{Escalation, TerminalPrompt};
use crate::fleet::{FleetLister, ListOptions, Listing, StatusFilter};
use crate::remote::SshExecutor;
use crate::resolve::resolve_guest;
use anyhow::{Context, Result};
use clap::{ArgAction, CommandFactory, Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "vmctl",
    version,
    about = "Control Proxmox VMs and containers across nodes via SSH"
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Path to config file (default: ./vmctl.yaml or ~/.config/vmctl-ng/config.yaml)"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        overrides_with = "no_askpass",
        help = "Prompt for the sudo password if a node needs one"
    )]
    askpass: bool,

    #[arg(
        long,
        global = true,
        overrides_with = "askpass",
        help = "Never prompt for a sudo password (default)"
    )]
    no_askpass: bool,

    #[arg(
        long,
        short = 'o',
        value_enum,
        default_value_t = OutputFormat::Pretty,
        global = true,
        help = "Output format for listings"
    )]
    output: OutputFormat,

    #[arg(
        short,
        long,
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v, -vv, -vvv)"
    )]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a guest (qm/pct start)
    Start {
        #[arg(value_name = "GUEST", help = "Guest name or numeric ID")]
        guest: String,
    },
    /// Stop a guest (qm/pct stop)
    Stop {
        #[arg(value_name = "GUEST", help = "Guest name or numeric ID")]
        guest: String,
    },
    /// Show the status of a guest (qm/pct status)
    Status {
        #[arg(value_name = "GUEST", help = "Guest name or numeric ID")]
        guest: String,
    },
    /// List VMs and LXCs across nodes
    List {
        #[arg(short = 'n', long, value_name = "NODE", help = "Restrict listing to a single node")]
        node: Option<String>,
        #[arg(long, conflicts_with = "stopped", help = "Show only running guests")]
        running: bool,
        #[arg(long, help = "Show only stopped guests")]
        stopped: bool,
        #[arg(long, help = "Fail fast if any node is unreachable")]
        strict: bool,
    },
    /// VM-related actions
    #[command(subcommand)]
    Vm(VmCommand),
    /// Show the resolved config file and node topology
    ConfigShow,
    /// Generate shell completion scripts
    Completion {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand)]
enum VmCommand {
    /// List VMs from config
    List,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum OutputFormat {
    Pretty,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GuestAction {
    Start,
    Stop,
    Status,
}

impl GuestAction {
    fn as_str(self) -> &'static str {
        match self {
            GuestAction::Start => "start",
            GuestAction::Stop => "stop",
            GuestAction::Status => "status",
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    if let Commands::Completion { shell } = &cli.command {
        use clap_complete::{generate, shells};
        let mut cmd = Cli::command();
        let bin = cmd.get_name().to_string();
        let mut out = io::stdout();
        match shell {
            CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin, &mut out),
            CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin, &mut out),
            CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin, &mut out),
            CompletionShell::PowerShell => {
                generate(shells::PowerShell, &mut cmd, bin, &mut out)
            }
        }
        return Ok(EXIT_OK);
    }

    let cwd = std::env::current_dir().context("reading current directory")?;
    let (config_path, config) = config::resolve(cli.config.as_deref(), &cwd)?;

    let executor = SshExecutor::new();
    let prompt = TerminalPrompt;
    let escalation = Escalation::new(&executor, &prompt, cli.askpass);
    let mut stdout = io::stdout().lock();

    match cli.command {
        Commands::Start { guest } => {
            run_guest_action(&config, &escalation, GuestAction::Start, &guest, &mut stdout)
        }
        Commands::Stop { guest } => {
            run_guest_action(&config, &escalation, GuestAction::Stop, &guest, &mut stdout)
        }
        Commands::Status { guest } => {
            run_guest_action(&config, &escalation, GuestAction::Status, &guest, &mut stdout)
        }
        Commands::List {
            node,
            running,
            stopped,
            strict,
        } => {
            let filter = match (running, stopped) {
                (true, _) => Some(StatusFilter::Running),
                (_, true) => Some(StatusFilter::Stopped),
                _ => None,
            };
            let opts = ListOptions {
                node,
                filter,
                strict,
            };
            let listing = FleetLister::new(&escalation, config.defaults.listing).list(&config, &opts)?;
            match cli.output {
                OutputFormat::Pretty => render_listing(&listing, &mut stdout)?,
                OutputFormat::Json => {
                    writeln!(stdout, "{}", serde_json::to_string_pretty(&listing)?)?
                }
            }
            Ok(if listing.is_partial() {
                EXIT_PARTIAL
            } else {
                EXIT_OK
            })
        }
        Commands::Vm(VmCommand::List) => {
            render_vm_list(&config, cli.output, &mut stdout)?;
            Ok(EXIT_OK)
        }
        Commands::ConfigShow => {
            render_config(&config_path, &config, &mut stdout)?;
            Ok(EXIT_OK)
        }
        Commands::Completion { .. } => Ok(EXIT_OK),
    }
}

fn run_guest_action(
    config: &Config,
    escalation: &Escalation<'_>,
    action: GuestAction,
    target: &str,
    out: &mut impl Write,
) -> Result<u8> {
    let guest = resolve_guest(config, target)?;
    let node = config
        .nodes
        .get(&guest.node)
        .ok_or_else(|| ResolveError::UnknownNode(guest.node.clone()))?;
    let family = guest.kind.command();
    let command = format!("{family} {} {}", action.as_str(), guest.id);
    info!(node = %node.name, host = %node.host, command = %command, "guest action");

    let stdout = escalation.run(node, &command, family)?;
    out.write_all(stdout.as_bytes())?;
    out.flush()?;
    Ok(EXIT_OK)
}

/// Display width as counted by `{:<w$}` padding.
fn width(text: &str) -> usize {
    text.chars().count()
}

fn render_listing(listing: &Listing, out: &mut impl Write) -> io::Result<()> {
    let groups = listing.by_node();

    if groups.is_empty() && listing.failed_nodes.is_empty() {
        writeln!(out, "No guests found.")?;
        return Ok(());
    }

    for (idx, (node, rows)) in groups.iter().enumerate() {
        let ids: Vec<String> = rows.iter().map(|g| g.id.to_string()).collect();
        let id_width = ids.iter().map(|id| width(id)).fold("ID".len(), usize::max);
        let name_width = rows.iter().map(|g| width(&g.name)).fold("NAME".len(), usize::max);
        let status_width = rows
            .iter()
            .map(|g| width(&g.status))
            .fold("STATUS".len(), usize::max);

        writeln!(out, "NODE: {node}")?;
        writeln!(
            out,
            "  {:<id_width$} {:<name_width$} {:<status_width$} TYPE",
            "ID", "NAME", "STATUS"
        )?;
        for (guest, id) in rows.iter().zip(&ids) {
            writeln!(
                out,
                "  {:<id_width$} {:<name_width$} {:<status_width$} {}",
                id, guest.name, guest.status, guest.kind
            )?;
        }
        if idx + 1 != groups.len() {
            writeln!(out)?;
        }
    }

    if listing.is_partial() {
        if !groups.is_empty() {
            writeln!(out)?;
        }
        writeln!(out, "FAILED NODES")?;
        for failure in &listing.failed_nodes {
            writeln!(
                out,
                "  {} ({}:{}): {}",
                failure.node, failure.host, failure.port, failure.message
            )?;
        }
        if groups.is_empty() {
            writeln!(out, "No nodes reachable.")?;
        }
    }
    Ok(())
}

fn render_vm_list(config: &Config, output: OutputFormat, out: &mut impl Write) -> Result<()> {
    match output {
        OutputFormat::Pretty => {
            writeln!(out, "NAME\tVMID\tNODE")?;
            for (name, (node, vmid)) in &config.vm_index {
                writeln!(out, "{name}\t{vmid}\t{node}")?;
            }
        }
        OutputFormat::Json => {
            let rows: Vec<_> = config
                .vm_index
                .iter()
                .map(|(name, (node, vmid))| json!({"name": name, "vmid": vmid, "node": node}))
                .collect();
            writeln!(out, "{}", serde_json::to_string_pretty(&rows)?)?;
        }
    }
    Ok(())
}

fn render_config(path: &Path, config: &Config, out: &mut impl Write) -> Result<()> {
    let shown = json!({
        "path": path.display().to_string(),
        "defaults": config.defaults,
        "nodes": config.nodes,
    });
    writeln!(out, "{}", serde_json::to_string_pretty(&shown)?)?;
    Ok(())
}

//! netboot CLI - NetDimm network boot client and cabinet supervisor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::signal;

use netboot::cabinet::{
    Cabinet, CabinetHost, CabinetManager, CabinetState, CabinetStatus, GameSelection,
};
use netboot::cli::*;
use netboot::config::{init_logging, Config};
use netboot::crypto::parse_key;
use netboot::error::{Error, Result};
use netboot::host::{Host, HostOptions, PingProbe};
use netboot::message::{MessageChannel, MESSAGE_HOST_STDERR, MESSAGE_HOST_STDOUT};
use netboot::transfer::SendOptions;
use netboot::transport::NetDimmLink;
use netboot::types::{CrcStatus, PeekPokeWidth, TransferInfo};
use netboot::util;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config if specified
    let config = if let Some(ref path) = cli.config {
        Config::load(path)?
    } else if Config::default_path().exists() {
        Config::load(Config::default_path())?
    } else {
        Config::default()
    };

    // Command line wins over the config file
    let log_config = netboot::config::LoggingConfig {
        level: cli.log_level.clone(),
        color: !cli.no_color && config.logging.color,
        ..config.logging.clone()
    };
    init_logging(&log_config)?;

    if cli.no_color {
        colored::control::set_override(false);
    }
    let json = cli.format == OutputFormat::Json;

    // Dispatch command
    match cli.command {
        Commands::Info(args) => run_info(args, &config, json).await,
        Commands::Send(args) => run_send(args, &config).await,
        Commands::Receive(args) => run_receive(args, &config).await,
        Commands::Peek(args) => run_peek(args, &config, json).await,
        Commands::Poke(args) => run_poke(args, &config).await,
        Commands::Dump(args) => run_dump(args, &config).await,
        Commands::Load(args) => run_load(args, &config).await,
        Commands::Reboot(args) => run_reboot(args, &config).await,
        Commands::SetTimeLimit(args) => run_set_time_limit(args, &config).await,
        Commands::Wipe(args) => run_wipe(args, &config).await,
        Commands::Ensure(args) => run_ensure(args, &config).await,
        Commands::Manage(args) => run_manage(args, &config, json).await,
        Commands::Stdio(args) => run_stdio(args, &config).await,
        Commands::Config(args) => run_config(args),
    }
}

/// Open a link for a target command
fn link_for(args: &TargetArgs, config: &Config) -> Result<NetDimmLink> {
    let link = NetDimmLink::new(args.ip, args.platform(), args.link_config(&config.link))
        .with_version(args.firmware_version()?);
    Ok(link)
}

fn transfer_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░"),
    );
    pb.set_message(message.to_string());
    pb
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Other(anyhow::anyhow!("cannot encode output: {e}")))?;
    println!("{text}");
    Ok(())
}

/// Show target info
async fn run_info(args: TargetArgs, config: &Config, json: bool) -> Result<()> {
    let mut link = link_for(&args, config)?;
    let info = link.info().await?;

    if json {
        return print_json(&info);
    }
    print_info(&args, &info);
    Ok(())
}

fn print_info(args: &TargetArgs, info: &TransferInfo) {
    let status = match info.game_crc_status {
        CrcStatus::Valid => info.game_crc_status.to_string().green(),
        CrcStatus::Checking | CrcStatus::Disabled => info.game_crc_status.to_string().yellow(),
        _ => info.game_crc_status.to_string().red(),
    };

    println!("{}", format!("NetDimm {} ({})", args.ip, args.platform()).bright_white().bold());
    println!("{}", "─".repeat(50));
    println!("  {} {}", "Firmware:".bright_white(), info.firmware_version);
    println!("  {} {} MiB", "DIMM memory:".bright_white(), info.memory_size);
    println!(
        "  {} {}",
        "Game memory:".bright_white(),
        util::format_bytes(u64::from(info.available_game_memory))
    );
    println!(
        "  {} {}",
        "Game size:".bright_white(),
        util::format_bytes(u64::from(info.current_game_size))
    );
    println!("  {} {:08x}", "Game CRC:".bright_white(), info.current_game_crc);
    println!("  {} {}", "CRC status:".bright_white(), status);
    println!("  {} {:08x}", "Control:".bright_white(), info.control_address);
}

/// Send an image
async fn run_send(args: SendArgs, config: &Config) -> Result<()> {
    let data = tokio::fs::read(&args.image).await?;
    let key = args.key.as_deref().map(parse_key).transpose()?;
    let options = SendOptions {
        key,
        disable_crc_check: args.disable_crc,
        disable_now_loading: args.disable_now_loading,
    };

    let mut link = link_for(&args.target, config)?;
    println!(
        "{} Sending {} ({}) to {}",
        "→".cyan(),
        args.image.display(),
        util::format_bytes(data.len() as u64),
        args.target.ip
    );

    let pb = transfer_bar("Sending");
    let bar = pb.clone();
    let started = Instant::now();
    let result = link
        .send(&data, &options, move |sent, total| {
            bar.set_length(total);
            bar.set_position(sent);
        })
        .await;

    match result {
        Ok(()) => pb.finish_with_message(format!(
            "{} Sent in {}",
            "✓".green(),
            util::format_duration(started.elapsed())
        )),
        Err(e) => {
            pb.abandon_with_message(format!("{} Send failed", "✗".red()));
            return Err(e);
        }
    }

    if !args.no_reboot {
        link.reboot().await?;
        println!("{} Rebooted into new image", "✓".green());
    }
    Ok(())
}

/// Download the current image
async fn run_receive(args: ReceiveArgs, config: &Config) -> Result<()> {
    let mut link = link_for(&args.target, config)?;
    let pb = transfer_bar("Receiving");
    let bar = pb.clone();
    let started = Instant::now();

    let image = link
        .receive(move |received, total| {
            bar.set_length(total);
            bar.set_position(received);
        })
        .await?;

    let Some(image) = image else {
        pb.abandon_with_message(format!("{} No valid image on target", "⚠".yellow()));
        return Ok(());
    };
    pb.finish_with_message(format!(
        "{} Received in {}",
        "✓".green(),
        util::format_duration(started.elapsed())
    ));

    tokio::fs::write(&args.output, &image).await?;
    println!(
        "{} Wrote {} to {}",
        "✓".green(),
        util::format_bytes(image.len() as u64),
        args.output.display()
    );
    Ok(())
}

/// Read one value
async fn run_peek(args: PeekArgs, config: &Config, json: bool) -> Result<()> {
    let width = PeekPokeWidth::from(args.width);
    let mut link = link_for(&args.target, config)?;
    let value = link.peek(args.address, width).await?;

    if json {
        return print_json(&serde_json::json!({ "address": args.address, "value": value }));
    }
    let digits = width.size() * 2;
    println!("{:08x}: {:0digits$x}", args.address, value);
    Ok(())
}

/// Write one value
async fn run_poke(args: PokeArgs, config: &Config) -> Result<()> {
    let width = PeekPokeWidth::from(args.width);
    let mut link = link_for(&args.target, config)?;
    link.poke(args.address, width, args.value).await?;
    println!(
        "{} Wrote {:x} to {:08x}",
        "✓".green(),
        width.mask(args.value),
        args.address
    );
    Ok(())
}

/// Dump DIMM memory
async fn run_dump(args: DumpArgs, config: &Config) -> Result<()> {
    let mut link = link_for(&args.target, config)?;
    let data = link.receive_chunk(args.offset, args.length).await?;

    match args.output {
        Some(ref path) => {
            tokio::fs::write(path, &data).await?;
            println!(
                "{} Wrote {} to {}",
                "✓".green(),
                util::format_bytes(data.len() as u64),
                path.display()
            );
        }
        None => print!("{}", util::hex_dump(args.offset, &data)),
    }
    Ok(())
}

/// Load a file into DIMM memory
async fn run_load(args: LoadArgs, config: &Config) -> Result<()> {
    let data = tokio::fs::read(&args.file).await?;
    let mut link = link_for(&args.target, config)?;
    link.send_chunk(args.offset, &data).await?;
    println!(
        "{} Loaded {} at {:08x}",
        "✓".green(),
        util::format_bytes(data.len() as u64),
        args.offset
    );
    Ok(())
}

async fn run_reboot(args: TargetArgs, config: &Config) -> Result<()> {
    link_for(&args, config)?.reboot().await?;
    println!("{} Rebooted {}", "✓".green(), args.ip);
    Ok(())
}

async fn run_set_time_limit(args: TimeLimitArgs, config: &Config) -> Result<()> {
    link_for(&args.target, config)?
        .set_time_limit(args.minutes)
        .await?;
    println!("{} Time limit set to {} minutes", "✓".green(), args.minutes);
    Ok(())
}

async fn run_wipe(args: TargetArgs, config: &Config) -> Result<()> {
    link_for(&args, config)?.wipe_current_game().await?;
    println!("{} Current game invalidated on {}", "✓".green(), args.ip);
    Ok(())
}

fn state_colored(state: CabinetState) -> colored::ColoredString {
    let name = state.to_string();
    match state {
        CabinetState::WaitPowerOff => name.green(),
        CabinetState::SendGame | CabinetState::CheckGame => name.yellow(),
        CabinetState::Startup | CabinetState::WaitPowerOn => name.normal(),
    }
}

/// Keep one cabinet loaded
async fn run_ensure(args: EnsureArgs, config: &Config) -> Result<()> {
    let target = &args.target;
    let options = HostOptions {
        target: target.platform(),
        version: target.firmware_version()?,
        time_hack: args.time_hack,
        link: target.link_config(&config.link),
        control_timeout: config.manager.control_timeout,
        liveness_debounce: config.manager.liveness_debounce,
    };
    let host = Arc::new(Host::new(target.ip, options));
    host.start_liveness(Arc::new(PingProbe));

    let cabinet = Cabinet::new(
        target.ip,
        String::new(),
        target.platform(),
        target.firmware_version()?,
        host,
        GameSelection::new(&args.image),
    );

    println!(
        "{} Keeping {} loaded on {} (Ctrl+C to stop)",
        "→".cyan(),
        args.image.display(),
        target.ip
    );

    let mut interval = tokio::time::interval(config.manager.tick_interval);
    let mut last = cabinet.state();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            _ = interval.tick() => {}
        }
        cabinet.tick().await;

        let now = cabinet.state();
        if now.0 != last.0 || (now.0 == CabinetState::SendGame && now.1 != last.1) {
            if now.0 == CabinetState::SendGame {
                println!("  {} {} {}%", "●".cyan(), state_colored(now.0), now.1);
            } else {
                println!("  {} {}", "●".cyan(), state_colored(now.0));
            }
            last = now;
        }
    }

    cabinet.host().stop_monitoring();
    println!("{} Stopped", "✓".green());
    Ok(())
}

fn print_statuses(statuses: &[CabinetStatus]) {
    println!("{}", "Cabinets:".bright_white().bold());
    for status in statuses {
        let game = status
            .filename
            .as_deref()
            .map_or_else(|| "-".to_string(), |f| f.display().to_string());
        let progress = if status.state == CabinetState::SendGame {
            format!(" {}%", status.progress)
        } else {
            String::new()
        };
        println!(
            "  {} {:<15} {:<16}{} {} {}",
            "●".cyan(),
            status.ip,
            state_colored(status.state),
            progress,
            game,
            status.description.dimmed()
        );
    }
}

/// Supervise the configured fleet
async fn run_manage(args: ManageArgs, config: &Config, json: bool) -> Result<()> {
    if config.cabinets.is_empty() {
        return Err(Error::Config(
            "No cabinets configured. Use --config <path> with [[cabinets]] entries".into(),
        ));
    }

    let manager = CabinetManager::from_config(config).await?;
    manager.start();
    println!(
        "{} Supervising {} cabinet(s) (Ctrl+C to stop)",
        "→".cyan(),
        manager.len()
    );

    let report_every = Duration::from_secs(args.report_interval.max(1));
    let mut report = tokio::time::interval(report_every);
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            _ = report.tick() => {
                if args.report_interval == 0 {
                    continue;
                }
                let statuses = manager.statuses();
                if json {
                    print_json(&statuses)?;
                } else {
                    print_statuses(&statuses);
                }
            }
        }
    }

    manager.stop().await;
    println!("{} Stopped", "✓".green());
    Ok(())
}

const STDIO_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Relay target stdout/stderr
async fn run_stdio(args: StdioArgs, config: &Config) -> Result<()> {
    let mut link = link_for(&args.target, config)?;
    link.open().await?;
    let mut channel = MessageChannel::new(link, config.message.clone());

    let idle = Duration::from_millis(args.poll_ms);
    loop {
        let message = tokio::select! {
            _ = signal::ctrl_c() => break,
            message = channel.receive_message() => message,
        };

        let message = match message {
            Ok(message) => message,
            Err(e) if e.is_recoverable() => {
                println!("{} Lost target ({e}), reconnecting", "⚠".yellow());
                let link = channel.registers();
                link.close();
                tokio::time::sleep(STDIO_RECONNECT_DELAY).await;
                if let Err(e) = link.open().await {
                    tracing::debug!(error = %e, "Reconnect failed");
                }
                continue;
            }
            Err(e) => return Err(e),
        };

        match message {
            Some(message) if message.id == MESSAGE_HOST_STDOUT => {
                print!("{}", String::from_utf8_lossy(&message.data));
            }
            Some(message) if message.id == MESSAGE_HOST_STDERR => {
                eprint!("{}", String::from_utf8_lossy(&message.data));
            }
            Some(message) => {
                println!(
                    "{} message {:#06x} ({} bytes)",
                    "⚠".yellow(),
                    message.id,
                    message.data.len()
                );
            }
            None => tokio::time::sleep(idle).await,
        }
    }

    channel.into_inner().close();
    Ok(())
}

fn run_config(args: ConfigArgs) -> Result<()> {
    let config = Config::example();
    let output = toml::to_string_pretty(&config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

    if let Some(ref path) = args.output {
        std::fs::write(path, &output)?;
        println!(
            "{} Configuration written to {}",
            "✓".green(),
            path.display()
        );
    } else {
        println!("{output}");
    }

    Ok(())
}

use anyhow::Result;
use clap::{Parser, Subcommand};
use clinscribe::device::{CpalHost, DeviceHost};
use clinscribe::{recovery, Config};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "clinscribe", about = "Clinical dictation capture core")]
struct Cli {
    /// Config file (without extension), loaded via the config crate
    #[arg(long, default_value = "config/clinscribe")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List available audio input devices
    Devices,
    /// Scan for crashed or abandoned recordings awaiting recovery
    Recover,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cfg = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("Could not load config '{}' ({}); using defaults", cli.config, e);
            Config::default()
        }
    };

    match cli.command {
        Some(Command::Devices) => {
            let host = CpalHost;
            let default = host.default_input_name();
            for name in host.input_device_names()? {
                let marker = if Some(&name) == default.as_ref() {
                    " (default)"
                } else {
                    ""
                };
                println!("{}{}", name, marker);
            }
        }
        Some(Command::Recover) | None => {
            let sessions = recovery::scan_sessions(&cfg.autosave.root_dir)?;
            if sessions.is_empty() {
                info!("No incomplete recordings found");
            } else {
                for session in &sessions {
                    println!(
                        "{}  {:.1}s  last saved {}  context: {}",
                        session.session_id,
                        session.metadata.duration_estimate_secs,
                        session
                            .metadata
                            .last_saved_at
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "never".to_string()),
                        session.metadata.patient_context,
                    );
                }
            }
        }
    }

    Ok(())
}

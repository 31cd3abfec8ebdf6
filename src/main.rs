use std::time::Duration;

use anyhow::{bail, Context, Result};
use bluer::Address;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fairbuds::bluetooth::gatt::GattLink;
use fairbuds::bluetooth::scanner;
use fairbuds::config::AppConfig;
use fairbuds::device::equalizer::BAND_COUNT;
use fairbuds::device::{Band, ConnectionController, EqState, Preset};
use fairbuds::protocol::packet::hex;
use fairbuds::protocol::param::{GAIN_MAX_DB, GAIN_MIN_DB};

const CONNECT_ATTEMPTS: u32 = 3;

#[derive(Parser)]
#[command(
    name = "fairbuds",
    version,
    about = "BLE equalizer control for Fairphone Fairbuds",
    after_help = "The BLE address differs from the audio (BR/EDR) address. \
                  Use `fairbuds scan` to find it."
)]
struct Cli {
    /// Debug logging, including TX/RX hex dumps
    #[arg(short, long, global = true)]
    verbose: bool,

    /// BLE address of the earbuds (defaults to the configured device)
    #[arg(short, long, global = true)]
    address: Option<String>,

    /// Remember --address in the config file
    #[arg(long, global = true)]
    save: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Scan for BLE devices (also helps wake up the BLE stack)
    Scan {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Request battery levels and device name
    Info,
    /// Switch to a built-in preset: main, bass, flat, studio (or 1-4)
    Preset { name: String },
    /// Set all 8 band gains in dB
    Eq {
        #[arg(required = true, num_args = BAND_COUNT, allow_negative_numbers = true)]
        gains: Vec<f64>,
        /// Q factor applied to every band
        #[arg(long, default_value_t = 0.7)]
        q: f64,
    },
    /// Set the gain of one band in dB. The other bands are sent at 0 dB, Q 0.7
    Gain {
        band: usize,
        #[arg(allow_negative_numbers = true)]
        db: f64,
    },
    /// Set the Q factor of one band. The other bands are sent at 0 dB, Q 0.7
    Q { band: usize, q: f64 },
    /// Show band frequencies
    Bands,
    /// Send a raw QXW frame given as hex (the 515857 prefix is optional)
    Raw { hex: Vec<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "fairbuds=debug,bluer=info"
    } else {
        "fairbuds=info,bluer=warn"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut config = AppConfig::load();

    match &cli.command {
        Cmd::Scan { seconds } => return scan(*seconds).await,
        Cmd::Bands => {
            print_bands();
            return Ok(());
        }
        _ => {}
    }

    let address = resolve_address(&cli, &config)?;
    if cli.save {
        config.device_address = Some(address.to_string());
        config.save()?;
    }

    let controller = ConnectionController::new(config.uuids(), config.timing());
    info!("Using device {}", address);
    controller
        .connect_with_retry(|| GattLink::new(address), CONNECT_ATTEMPTS)
        .await
        .with_context(|| format!("connecting to {}", address))?;

    let result = run(&controller, &cli.command).await;

    if let Err(e) = controller.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
    result
}

async fn run(controller: &ConnectionController<GattLink>, command: &Cmd) -> Result<()> {
    match command {
        Cmd::Info => {
            let info = match controller.device_info() {
                Some(info) => info,
                None => controller.request_device_info().await?,
            };
            println!("{}", info);
        }
        Cmd::Preset { name } => {
            let preset = Preset::from_name(name)
                .with_context(|| format!("unknown preset '{}' (main, bass, flat, studio)", name))?;
            apply_preset(controller, preset).await?;
            println!("{} preset applied", preset);
        }
        Cmd::Eq { gains, q } => {
            warn_extended(gains);
            let bands: Vec<(f64, f64)> = gains.iter().map(|&g| (g, *q)).collect();
            controller.apply_preset(&bands).await?;
            print!("{}", controller.eq_state());
        }
        Cmd::Gain { band, db } => {
            warn_extended(std::slice::from_ref(db));
            controller.set_band_gain(*band, *db).await?;
            println!("Band {} set to {:+.1} dB", band, db);
        }
        Cmd::Q { band, q } => {
            controller.set_band_q(*band, *q).await?;
            println!("Band {} Q set to {:.1}", band, q);
        }
        Cmd::Raw { hex: parts } => {
            let joined = parts.concat();
            let bytes = hex::decode(&joined).with_context(|| format!("invalid hex '{}'", joined))?;
            match controller.send_raw(&bytes).await? {
                Some(response) => println!("Response: {:?}", response),
                None => println!("(no response)"),
            }
        }
        Cmd::Scan { .. } | Cmd::Bands => {}
    }
    Ok(())
}

/// Studio is selected first and then flattened; other presets need the
/// custom EQ cleared before they are selected.
async fn apply_preset(controller: &ConnectionController<GattLink>, preset: Preset) -> Result<()> {
    if preset == Preset::Studio {
        controller.select(preset).await?;
        controller.reset_eq().await?;
    } else {
        controller.reset_eq().await?;
        controller.select(preset).await?;
    }
    Ok(())
}

fn resolve_address(cli: &Cli, config: &AppConfig) -> Result<Address> {
    let Some(addr) = cli.address.as_ref().or(config.device_address.as_ref()) else {
        bail!(
            "no device address; pass --address (see `fairbuds scan`) or set device_address in {}",
            AppConfig::path().display()
        );
    };
    addr.parse::<Address>()
        .with_context(|| format!("invalid BLE address '{}'", addr))
}

async fn scan(seconds: u64) -> Result<()> {
    let devices = scanner::scan_le_devices(Duration::from_secs(seconds)).await?;
    println!("Found {} BLE devices:", devices.len());
    for d in devices {
        let rssi = d
            .rssi
            .map(|r| format!("{:4} dBm", r))
            .unwrap_or_else(|| "  ?? dBm".to_string());
        println!(
            "  {}  {}  {}",
            d.address,
            rssi,
            d.name.as_deref().unwrap_or("(unknown)")
        );
    }
    Ok(())
}

fn print_bands() {
    println!("Band frequencies:");
    for band in Band::all() {
        println!("  Band {}: {:5} Hz", band.index, band.frequency_hz);
    }
    println!(
        "Gain {:+.1} to {:+.1} dB, default Q {:.1}",
        GAIN_MIN_DB,
        GAIN_MAX_DB,
        EqState::new().bands()[0].q_factor()
    );
}

fn warn_extended(gains: &[f64]) {
    for g in gains {
        if !(GAIN_MIN_DB..=GAIN_MAX_DB).contains(g) {
            warn!(
                "Gain {:+.1} dB is outside {} to {} dB and will be clamped",
                g, GAIN_MIN_DB, GAIN_MAX_DB
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_single_band_help_mentions_reset() {
        let cmd = Cli::command();
        for name in ["gain", "q"] {
            let about = cmd
                .find_subcommand(name)
                .and_then(|c| c.get_about())
                .map(|a| a.to_string())
                .unwrap_or_default();
            assert!(about.contains("other bands are sent at 0 dB"), "{}: {}", name, about);
        }
    }

    #[test]
    fn test_parse_negative_gain() {
        let cli = Cli::try_parse_from(["fairbuds", "gain", "3", "-2.5"]).unwrap();
        assert!(matches!(cli.command, Cmd::Gain { band: 3, db } if db == -2.5));
    }
}

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use telepathy_core::{
    ScalarKind, Session, SessionConfig, Timestamp, TransportConfig, Type, Value,
};

#[derive(Parser, Debug)]
#[command(
    name = "telepathy",
    author,
    version,
    about = "Symbolic access to a live embedded target over XCP",
    long_about = "Read and write global variables of a running target, browse its \
                  model structure and stream signal samples, using DWARF debug info \
                  and the target's own model mapping structure."
)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Connect over TCP: HOST or HOST:PORT
    #[arg(long, conflicts_with = "serial")]
    tcp: Option<String>,

    /// Connect over a serial port device
    #[arg(long)]
    serial: Option<String>,

    /// Serial baud rate
    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Linked image (ELF with DWARF debug info)
    #[arg(long)]
    image: Option<PathBuf>,

    /// Skip the image version check against the target
    #[arg(long)]
    no_verify: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and print what the target reports about itself
    Info,
    /// List all known symbol paths
    List,
    /// Read a variable
    Read { path: String },
    /// Write a variable
    Write { path: String, value: String },
    /// Stream signals through DAQ and print each sample
    Monitor {
        /// Signal paths to sample
        #[arg(required = true)]
        paths: Vec<String>,
        /// Event channel to sample on
        #[arg(long, default_value_t = 1)]
        event: u16,
        /// Stop after this many samples (runs until interrupted otherwise)
        #[arg(long)]
        count: Option<u64>,
    },
}

fn build_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SessionConfig::default(),
    };

    if let Some(tcp) = &args.tcp {
        let (host, port) = match tcp.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse().context("invalid TCP port")?,
            ),
            None => (tcp.clone(), telepathy_core::transport::DEFAULT_PORT),
        };
        config.transport = TransportConfig::Tcp { host, port };
    } else if let Some(port) = &args.serial {
        config.transport = TransportConfig::Serial {
            port: port.clone(),
            baud: args.baud,
        };
    }

    if let Some(image) = &args.image {
        config.image_path = Some(image.display().to_string());
    }
    if args.no_verify {
        config.verify_image_version = false;
    }
    Ok(config)
}

/// Parse a user-supplied value according to the destination type.
fn parse_value(text: &str, ty: &Type) -> Result<Value> {
    match ty {
        Type::Scalar {
            kind: ScalarKind::Float,
            ..
        } => Ok(Value::Float(text.parse()?)),
        Type::Scalar {
            kind: ScalarKind::Signed,
            ..
        } => Ok(Value::SignedInt(text.parse()?)),
        Type::Scalar {
            kind: ScalarKind::Unsigned,
            ..
        }
        | Type::Pointer { .. } => {
            let value = match text.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16)?,
                None => text.parse()?,
            };
            Ok(Value::UnsignedInt(value))
        }
        other => bail!("cannot parse a value of type {} from the command line", other),
    }
}

fn run(args: Args) -> Result<()> {
    let config = build_config(&args)?;
    let has_image = config.image_path.is_some();
    let mut session = Session::connect(config)?;

    // The model map is optional: plain firmware has DWARF symbols only.
    if has_image {
        match session.load_model_map() {
            Ok(()) => {}
            Err(e) => info!(error = %e, "no model map available"),
        }
    }

    match args.command {
        Command::Info => {
            let info = session
                .client()
                .connect_info()
                .context("not connected")?;
            println!("state:             {}", session.state());
            println!("byte order:        {}", info.byte_order);
            println!("MAX_CTO:           {}", info.max_cto);
            println!("MAX_DTO:           {}", info.max_dto);
            println!("DAQ support:       {}", info.supports_daq());
            println!("calibration:       {}", info.supports_calibration());
            println!(
                "protocol version:  {}.{}",
                info.protocol_version, info.transport_version
            );
            if info.supports_daq() {
                let daq = session.client().get_daq_processor_info()?;
                println!("event channels:    {}", daq.max_event_channel);
                println!("timestamps:        {}", daq.timestamp_supported());
            }
        }

        Command::List => {
            for path in session.symbol_paths() {
                println!("{}", path);
            }
        }

        Command::Read { path } => {
            let symbol = session.resolve(&path)?;
            let value = session.read(&symbol)?;
            println!("{} = {}  ({} @ 0x{:08X})", path, value, symbol.ty, symbol.address);
        }

        Command::Write { path, value } => {
            let symbol = session.resolve(&path)?;
            let value = parse_value(&value, &symbol.ty)?;
            session.write(&symbol, &value)?;
            let back = session.read(&symbol)?;
            println!("{} = {}", path, back);
        }

        Command::Monitor {
            paths,
            event,
            count,
        } => {
            let signals: Vec<(&str, u16)> =
                paths.iter().map(|p| (p.as_str(), event)).collect();
            session.daq_configure(signals)?;
            session.daq_start()?;
            let stream = session.daq_samples()?;

            if stream.metadata().reduced_precision {
                warn!("target has no timestamping; sample times are host reception times");
            }

            let mut seen = 0u64;
            loop {
                let Some(sample) = stream.recv_timeout(Duration::from_secs(1)) else {
                    if stream.dropped() > 0 {
                        warn!(dropped = stream.dropped(), "samples dropped");
                    }
                    continue;
                };
                let time = match sample.timestamp {
                    Timestamp::Target(ticks) => format!("{:>10}", ticks),
                    Timestamp::Host(elapsed) => format!("{:>10.6}", elapsed.as_secs_f64()),
                };
                let list = &stream.metadata().lists[sample.list_index];
                let fields: Vec<String> = list
                    .entry_paths
                    .iter()
                    .zip(&sample.values)
                    .map(|(path, value)| format!("{}={}", path, value))
                    .collect();
                println!("{}  {}", time, fields.join("  "));

                seen += 1;
                if count.is_some_and(|limit| seen >= limit) {
                    break;
                }
            }
            session.daq_stop()?;
        }
    }

    session.disconnect()?;
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::WARN.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

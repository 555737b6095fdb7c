//! Serial ↔ TCP forwarder.
//!
//! Bridges the target's USB-serial XCP interface to a TCP socket so the
//! host tools (and anything else speaking XCP-on-TCP) can reach it over
//! the network. One TCP client at a time; while a client is connected, no
//! new connections are accepted. The serial port is reopened automatically
//! when the device goes away and comes back.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serialport::SerialPort;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "telepathy-proxy",
    author,
    version,
    about = "Forward an XCP serial link to a TCP socket"
)]
struct Args {
    /// Serial port device (e.g. /dev/ttyACM0 or COM3)
    port: String,

    /// Serial baud rate
    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// TCP port to listen on
    #[arg(long, default_value_t = 17725)]
    listen: u16,
}

type SharedSocket = Arc<Mutex<Option<TcpStream>>>;
type SharedSerial = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

/// Own the serial port: (re-)open it as needed, publish a write handle for
/// the socket thread and forward everything read to the current socket.
fn serial_to_socket(args: Args, serial: SharedSerial, socket: SharedSocket) {
    let mut reader: Option<Box<dyn SerialPort>> = None;
    let mut announced = false;
    let mut buf = [0u8; 1024];

    loop {
        let Some(port) = reader.as_mut() else {
            match serialport::new(&args.port, args.baud)
                .timeout(Duration::from_millis(500))
                .open()
            {
                Ok(opened) => match opened.try_clone() {
                    Ok(writer) => {
                        info!(port = %args.port, "serial port connected");
                        announced = true;
                        *serial.lock().unwrap() = Some(writer);
                        reader = Some(opened);
                    }
                    Err(e) => {
                        error!(error = %e, "cannot clone serial port");
                        thread::sleep(Duration::from_secs(1));
                    }
                },
                Err(_) => {
                    if announced {
                        warn!(port = %args.port, "serial port disconnected");
                        announced = false;
                    }
                    thread::sleep(Duration::from_secs(1));
                }
            }
            continue;
        };

        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                let mut guard = socket.lock().unwrap();
                if let Some(stream) = guard.as_mut() {
                    if stream.write_all(&buf[..n]).is_err() {
                        // The socket loop notices on its next read.
                        guard.take();
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                warn!(error = %e, "serial read failed, reopening");
                reader = None;
                serial.lock().unwrap().take();
            }
        }
    }
}

/// Accept one TCP client at a time and forward its bytes to the serial
/// port.
fn socket_to_serial(args: &Args, serial: SharedSerial, socket: SharedSocket) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", args.listen))
        .with_context(|| format!("failed to listen on port {}", args.listen))?;
    info!(port = args.listen, "listening");

    loop {
        let (mut conn, addr) = listener.accept()?;
        let _ = conn.set_nodelay(true);
        info!(peer = %addr, "socket connected");
        *socket.lock().unwrap() = Some(conn.try_clone()?);

        let mut buf = [0u8; 1024];
        loop {
            let n = match conn.read(&mut buf) {
                Ok(0) => break, // closed by client
                Ok(n) => n,
                Err(_) => break,
            };
            let result = {
                let mut guard = serial.lock().unwrap();
                match guard.as_mut() {
                    Some(port) => port.write_all(&buf[..n]),
                    None => Err(std::io::Error::other("serial port not connected")),
                }
            };
            if let Err(e) = result {
                error!(error = %e, "error writing to serial port; closing socket");
                break;
            }
        }
        *socket.lock().unwrap() = None;
        info!("socket disconnected");
    }
}

fn main() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let args = Args::parse();
    let serial: SharedSerial = Arc::new(Mutex::new(None));
    let socket: SharedSocket = Arc::new(Mutex::new(None));

    let reader_args = Args {
        port: args.port.clone(),
        baud: args.baud,
        listen: args.listen,
    };
    let reader_serial = serial.clone();
    let reader_socket = socket.clone();
    thread::spawn(move || serial_to_socket(reader_args, reader_serial, reader_socket));

    if let Err(e) = socket_to_serial(&args, serial, socket) {
        error!(error = %e, "proxy failed");
        std::process::exit(1);
    }
}

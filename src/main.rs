//! `networkd` — user-space network daemon core (spec §2, §9).
//!
//! Single-threaded cooperative event loop: each tick drains the Ethernet
//! device and every connected IPC client, dispatching frames through
//! [`networkd::Context::tick`] and requests through
//! [`networkd::Context::handle_ipc`].

use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use networkd::config::{Args, EVENT_LOOP_TICK_MS};
use networkd::context::Context;
use networkd::crypto::Rand;
use networkd::error::DaemonError;
use networkd::net::device::FileDevice;
use networkd::net::ipc::UnixListenIo;

/// The host ioctl that fetches a real hardware MAC (`SIOCGIFHWADDR`) is out
/// of scope for this core (spec §6.1); a locally-administered address is
/// generated instead, with the bits RFC-mandated for that space set.
fn generate_mac(rand: &mut Rand) -> [u8; 6] {
    let mut mac = [0u8; 6];
    rand.bytes(&mut mac);
    mac[0] = (mac[0] & 0xFE) | 0x02;
    mac
}

fn run() -> Result<(), DaemonError> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(device = %args.device, ipc_name = %args.ipc_name, "starting networkd");

    let iface = args.iface_config();
    let mut rand = Rand::new();
    let our_mac = generate_mac(&mut rand);
    info!(mac = %hex::encode(our_mac), "generated interface MAC");

    let mut dev = FileDevice::open(&args.device, our_mac).map_err(|e| DaemonError::DeviceOpenFailed {
        path: args.device.clone(),
        source: e,
    })?;

    let socket_path = format!("/tmp/{}.sock", args.ipc_name);
    let mut listener = UnixListenIo::bind(&socket_path).map_err(DaemonError::IpcListenFailed)?;
    info!(path = %socket_path, "IPC listener bound");

    let mut ctx = Context::new(our_mac, iface);

    info!("event loop running");
    loop {
        ctx.tick(&mut dev);

        // `ctx.clients` is pulled out for the duration of `process` so its
        // dispatch closure can freely borrow the rest of `ctx` (which
        // `handle_ipc` needs) without aliasing the `ClientTable` itself.
        let mut clients = std::mem::take(&mut ctx.clients);
        clients.accept_pending(&mut listener);
        clients.process(|hdr, body| ctx.handle_ipc(&mut dev, hdr, body));
        ctx.clients = clients;

        std::thread::sleep(Duration::from_millis(EVENT_LOOP_TICK_MS));
    }
}

fn main() {
    if let Err(e) = run() {
        error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }
}

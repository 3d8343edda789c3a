mod daemonize;
mod opt;
mod pty;

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use structopt::StructOpt;
use tokio::signal::unix::{signal, SignalKind};
use tokio_serial::SerialPortBuilderExt;

use gsmux::{Config, Error};
use opt::Opt;

/// The underlying device line speed handed to `tokio_serial`. `AT+CMUX`'s own
/// baud index is a separate concept, negotiated with the modem during bringup.
const SERIAL_LINE_SPEED: u32 = 115_200;

async fn open_serial(device: PathBuf) -> Result<tokio_serial::SerialStream, Error> {
    tokio_serial::new(device.to_string_lossy(), SERIAL_LINE_SPEED)
        .open_native_async()
        .map_err(|e| Error::Io(e.into()))
}

async fn open_endpoint(
    path: PathBuf,
    index: usize,
    symlink_prefix: Option<String>,
    aliases: Rc<RefCell<Vec<Option<PathBuf>>>>,
) -> Result<pty::Endpoint, Error> {
    let endpoint = pty::open_endpoint(&path).map_err(|e| Error::Io(e.into()))?;
    if let Some(prefix) = symlink_prefix {
        if let Some(alias) = pty::create_alias(&prefix, index, &endpoint).map_err(Error::Io)? {
            info!("endpoint {} aliased at {}", index, alias.display());
            aliases.borrow_mut()[index] = Some(alias);
        }
    }
    Ok(endpoint)
}

/// Removes every alias symlink created so far, clearing the tracking table.
/// Called on orderly shutdown and before each restart re-opens the endpoints,
/// so a stale `<prefix>N` never survives past the handle it pointed at.
fn remove_all_aliases(aliases: &Rc<RefCell<Vec<Option<PathBuf>>>>) {
    for slot in aliases.borrow_mut().iter_mut() {
        if let Some(alias) = slot.take() {
            pty::remove_alias(&alias);
        }
    }
}

fn install_signal_handlers(terminate_requested: Arc<AtomicBool>) -> Result<()> {
    for kind in [
        SignalKind::interrupt(),
        SignalKind::terminate(),
        SignalKind::hangup(),
        SignalKind::user_defined1(),
    ] {
        let mut stream = signal(kind).context("registering a Unix signal handler")?;
        let flag = terminate_requested.clone();
        tokio::spawn(async move {
            loop {
                if stream.recv().await.is_none() {
                    return;
                }
                info!("shutdown signal received");
                flag.store(true, Ordering::Relaxed);
            }
        });
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    log::debug!("{:#?}", opt);

    let daemon = daemonize::daemonize(opt.debug, opt.wait).context("failed to daemonize")?;

    let config = Config {
        max_frame_size: opt.max_frame_size,
        baud_rate: opt.baud,
        pin_code: opt.pin,
        channel_count: opt.endpoints.len(),
        fault_tolerant: opt.fault_tolerant,
        send_version_probe: false,
    };
    config.validate().context("invalid configuration")?;

    let terminate_requested = Arc::new(AtomicBool::new(false));
    install_signal_handlers(terminate_requested.clone())?;

    let device = opt.device.clone();
    let serial_factory = move || open_serial(device.clone());

    let aliases: Rc<RefCell<Vec<Option<PathBuf>>>> = Rc::new(RefCell::new(vec![None; opt.endpoints.len()]));

    let endpoint_paths = opt.endpoints.clone();
    let symlink_prefix = opt.symlink_prefix.clone();
    let aliases_for_factory = aliases.clone();
    let endpoint_factory = move |i: usize| open_endpoint(endpoint_paths[i].clone(), i, symlink_prefix.clone(), aliases_for_factory.clone());

    let aliases_for_teardown = aliases.clone();
    let on_teardown = move || remove_all_aliases(&aliases_for_teardown);

    // `daemonize` only hands back a `Daemon` when `-w`/`--wait` was given;
    // the first successful bringup tells the blocked parent it can exit 0.
    let already_notified = Cell::new(false);
    let on_bringup = || {
        if !already_notified.replace(true) {
            if let Some(daemon) = &daemon {
                daemon.notify_ready();
            }
        }
    };

    let result = gsmux::supervisor::run(serial_factory, endpoint_factory, opt.endpoints.len(), config, terminate_requested, on_bringup, on_teardown).await;

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("gsmuxd exiting: {}", e);
            Err(anyhow::anyhow!(e))
        }
    }
}

//! The single-threaded cooperative loop that drives one mux session: serial
//! reads flow through the receive buffer and link engine, endpoint reads are
//! fragmented onto the wire, and a watchdog restarts a stalled link when
//! fault-tolerant mode is enabled.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::select_all;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout, Instant};

use crate::bridge::{self, ENDPOINT_READ_SIZE};
use crate::buffer::ReceiveBuffer;
use crate::bringup;
use crate::channel::ChannelTable;
use crate::config::Config;
use crate::constants::{DISC, PF};
use crate::frame;
use crate::link;
use crate::Error;

const READINESS_TIMEOUT: Duration = Duration::from_secs(1);
const SERIAL_READ_CAPACITY: usize = 4096;
const SERIAL_BUFFER_CAPACITY: usize = 8192;
const MAX_PINGS: u32 = 4;
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Why a session's service loop stopped.
pub enum Outcome {
    /// A shutdown signal was observed and the stepwise close completed.
    Terminated,
    /// The watchdog or a peer-initiated close asked for a fresh bringup.
    RestartRequested,
    /// Bringup or an unrecoverable I/O error ended the session.
    Fatal(Error),
}

type ReadFuture<'a> = Pin<Box<dyn Future<Output = (usize, std::io::Result<usize>)> + 'a>>;

/// Runs one bringup-to-teardown session over already-open handles.
///
/// `endpoint_factory` is used to reopen a single endpoint in place when its
/// read fails (§4.7); a full link restart (serial included) is the caller's
/// responsibility, signalled by returning [`Outcome::RestartRequested`].
pub async fn run_once<S, E, EF, EFut>(
    serial: &mut S,
    endpoints: &mut [E],
    endpoint_factory: &mut EF,
    config: &Config,
    terminate_requested: &AtomicBool,
    on_bringup: impl FnOnce(),
) -> Outcome
where
    S: AsyncRead + AsyncWrite + Unpin,
    E: AsyncRead + AsyncWrite + Unpin,
    EF: FnMut(usize) -> EFut,
    EFut: Future<Output = Result<E, Error>>,
{
    if let Err(e) = bringup::bring_up(serial, config).await {
        return Outcome::Fatal(e);
    }
    on_bringup();

    let mut channels = ChannelTable::new();
    channels.set_open(0, true);
    for ch in 1..=config.channel_count as u8 {
        channels.set_open(ch, true);
    }

    let mut buffer = ReceiveBuffer::new(SERIAL_BUFFER_CAPACITY);
    let mut terminate = false;
    let mut terminate_count: i32 = config.channel_count as i32;
    let mut last_frame_time = Instant::now();
    let mut ping_count: u32 = 1;

    let mut serial_scratch = vec![0u8; SERIAL_READ_CAPACITY];
    let mut endpoint_scratch: Vec<[u8; ENDPOINT_READ_SIZE]> = vec![[0u8; ENDPOINT_READ_SIZE]; endpoints.len()];

    loop {
        if terminate_requested.load(Ordering::Relaxed) {
            terminate = true;
        }
        if terminate {
            if let Err(e) = stepwise_shutdown(serial, &channels, terminate_count, config.max_frame_size).await {
                warn!("error during shutdown: {}", e);
            }
            return Outcome::Terminated;
        }

        let read_len = buffer.free().min(serial_scratch.len());
        let mut futs: Vec<ReadFuture> = Vec::with_capacity(1 + endpoints.len());
        futs.push(Box::pin(async {
            (0usize, serial.read(&mut serial_scratch[..read_len]).await)
        }));
        for (i, (endpoint, scratch)) in endpoints.iter_mut().zip(endpoint_scratch.iter_mut()).enumerate() {
            futs.push(Box::pin(async move { (i + 1, endpoint.read(scratch).await) }));
        }

        let ready = match timeout(READINESS_TIMEOUT, select_all(futs)).await {
            Ok((outcome, idx, remaining)) => {
                drop(remaining);
                let (slot, result) = outcome;
                debug_assert_eq!(slot, idx);
                Some((slot, result))
            }
            Err(_) => None,
        };

        if let Some((slot, result)) = ready {
            if slot == 0 {
                match result {
                    Ok(0) | Err(_) => return Outcome::Fatal(Error::Io(io_closed("serial port"))),
                    Ok(n) => {
                        buffer.write(&serial_scratch[..n]);
                        while let Some(decoded) = buffer.get_frame() {
                            let frame_outcome = link::handle_frame(&mut channels, &decoded, config.max_frame_size, config.fault_tolerant, config.send_version_probe);
                            last_frame_time = Instant::now();
                            ping_count = 1;

                            if let Some(reply) = &frame_outcome.reply {
                                if let Err(e) = serial.write_all(reply).await {
                                    return Outcome::Fatal(Error::Io(e));
                                }
                            }
                            if let Some((address, payload)) = &frame_outcome.deliver {
                                if let Some(endpoint) = endpoints.get_mut((*address - 1) as usize) {
                                    if let Err(e) = bridge::deliver_to_endpoint(endpoint, payload).await {
                                        warn!("endpoint {} write failed: {}", address - 1, e);
                                    }
                                }
                            }
                            if frame_outcome.restart {
                                info!("link engine requested a restart");
                                return Outcome::RestartRequested;
                            }
                            if frame_outcome.terminate {
                                terminate = true;
                                terminate_count = -1;
                            }
                        }
                    }
                }
            } else {
                let endpoint_index = slot - 1;
                match result {
                    Ok(0) | Err(_) => {
                        warn!("endpoint {} read failed, reopening", endpoint_index);
                        match endpoint_factory(endpoint_index).await {
                            Ok(fresh) => endpoints[endpoint_index] = fresh,
                            Err(e) => {
                                warn!("failed to reopen endpoint {}: {}", endpoint_index, e);
                                terminate = true;
                            }
                        }
                    }
                    Ok(n) => {
                        let channel = (endpoint_index + 1) as u8;
                        if let Err(e) = bridge::send_fragments(serial, channel, &endpoint_scratch[endpoint_index][..n], config.max_frame_size).await {
                            return Outcome::Fatal(e);
                        }
                    }
                }
            }
        }

        if config.fault_tolerant {
            let due = last_frame_time.elapsed() >= POLL_INTERVAL.saturating_mul(ping_count);
            if due {
                debug!("sending watchdog ping ({} of {})", ping_count, MAX_PINGS);
                let ping = link::ping_frame(config.max_frame_size);
                if let Err(e) = serial.write_all(&ping).await {
                    return Outcome::Fatal(Error::Io(e));
                }
                ping_count += 1;
            }
            if ping_count > MAX_PINGS {
                warn!("watchdog exceeded {} unanswered pings, restarting", MAX_PINGS);
                return Outcome::RestartRequested;
            }
        }
    }
}

async fn stepwise_shutdown<S>(serial: &mut S, channels: &ChannelTable, terminate_count: i32, max_frame_size: usize) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    if terminate_count < 0 {
        return Ok(());
    }

    for channel in (0..=terminate_count as u8).rev() {
        if channel == 0 {
            serial.write_all(&link::close_down_frame(max_frame_size)).await?;
        } else if channels.is_open(channel) {
            serial.write_all(&frame::encode(channel, &[], DISC | PF, true, max_frame_size)).await?;
        }
    }
    Ok(())
}

fn io_closed(what: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, format!("{} closed", what))
}

/// Runs sessions back to back: opens fresh handles via the given factories,
/// runs [`run_once`], and restarts or retries per the outcome until a
/// shutdown signal is observed or a non-fault-tolerant failure is fatal.
///
/// `on_teardown` is called once a session ends and its endpoint handles are
/// about to be dropped: on an orderly [`Outcome::Terminated`], and again
/// before every restart's re-open (both [`Outcome::RestartRequested`] and a
/// fault-tolerant [`Outcome::Fatal`] retry). It gives the caller a chance to
/// remove anything tied to the handles being discarded, such as pty alias
/// symlinks, before fresh ones are opened in their place.
pub async fn run<S, E, SF, SFut, EF, EFut>(
    mut serial_factory: SF,
    endpoint_factory: EF,
    endpoint_count: usize,
    config: Config,
    terminate_requested: std::sync::Arc<AtomicBool>,
    mut on_bringup: impl FnMut(),
    on_teardown: impl Fn(),
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
    E: AsyncRead + AsyncWrite + Unpin,
    SF: FnMut() -> SFut,
    SFut: Future<Output = Result<S, Error>>,
    EF: Fn(usize) -> EFut + Clone,
    EFut: Future<Output = Result<E, Error>>,
{
    loop {
        if terminate_requested.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut serial = serial_factory().await?;
        let mut endpoints = Vec::with_capacity(endpoint_count);
        for i in 0..endpoint_count {
            endpoints.push(endpoint_factory(i).await?);
        }

        let mut ef = endpoint_factory.clone();
        match run_once(&mut serial, &mut endpoints, &mut ef, &config, &terminate_requested, &mut on_bringup).await {
            Outcome::Terminated => {
                on_teardown();
                return Ok(());
            }
            Outcome::RestartRequested => {
                on_teardown();
                sleep(Duration::from_secs(1)).await;
                continue;
            }
            Outcome::Fatal(e) => {
                if config.fault_tolerant {
                    warn!("session failed ({}), retrying after the poll interval", e);
                    on_teardown();
                    sleep(POLL_INTERVAL).await;
                    continue;
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{DEFAULT_MAX_FRAME_SIZE, UA};
    use std::sync::Arc;
    use tokio::io::duplex;

    fn unused_fault_tolerant_config() -> Config {
        let mut config = Config::default();
        config.channel_count = 2;
        config.max_frame_size = DEFAULT_MAX_FRAME_SIZE;
        config
    }

    #[tokio::test]
    async fn stepwise_shutdown_closes_open_channels_then_control() {
        // S5: N=2, both channels open, orderly shutdown.
        let (mut here, mut there) = duplex(4096);
        let mut channels = ChannelTable::new();
        channels.set_open(1, true);
        channels.set_open(2, true);

        stepwise_shutdown(&mut here, &channels, 2, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        drop(here);

        let mut seen = Vec::new();
        let mut buf = ReceiveBuffer::new(4096);
        let mut scratch = [0u8; 256];
        loop {
            match there.read(&mut scratch).await {
                Ok(0) => break,
                Ok(n) => {
                    buf.write(&scratch[..n]);
                    while let Some(f) = buf.get_frame() {
                        seen.push((f.address, f.control));
                    }
                }
                Err(_) => break,
            }
        }

        assert_eq!(seen, vec![(2, DISC), (1, DISC), (0, crate::constants::UIH)]);
    }

    #[tokio::test]
    async fn fatal_terminate_count_skips_all_closes() {
        let (mut here, there) = duplex(4096);
        let channels = ChannelTable::new();
        stepwise_shutdown(&mut here, &channels, -1, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        drop(here);
        drop(there);
    }

    #[tokio::test]
    async fn run_once_terminates_promptly_when_flag_already_set() {
        let config = unused_fault_tolerant_config();
        let (mut serial_here, mut serial_there) = duplex(8192);
        let mut endpoints: Vec<tokio::io::DuplexStream> = Vec::new();

        // Prime the AT handshake so bringup completes immediately.
        let responder = tokio::spawn(async move {
            let mut scratch = [0u8; 256];
            loop {
                match serial_there.read(&mut scratch).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let _ = serial_there.write_all(b"OK\r\n").await;
                        let ua = frame::encode(0, &[], UA | PF, false, DEFAULT_MAX_FRAME_SIZE);
                        let _ = serial_there.write_all(&ua).await;
                    }
                    Err(_) => break,
                }
            }
        });

        let terminate_requested = Arc::new(AtomicBool::new(true));
        let mut factory = |_i: usize| async { Err::<tokio::io::DuplexStream, Error>(Error::BringupFailed("no endpoints configured")) };

        let outcome = run_once(&mut serial_here, &mut endpoints, &mut factory, &config, &terminate_requested, || {}).await;
        assert!(matches!(outcome, Outcome::Fatal(_)));
        responder.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_restarts_after_max_unanswered_pings() {
        // S6: fault-tolerant, peer never replies to pings or sends any
        // frame; the watchdog must eventually request a restart.
        let mut config = unused_fault_tolerant_config();
        config.channel_count = 0;
        config.fault_tolerant = true;

        let (mut serial_here, mut serial_there) = duplex(8192);
        let mut endpoints: Vec<tokio::io::DuplexStream> = Vec::new();
        let terminate_requested = Arc::new(AtomicBool::new(false));
        let mut factory = |_i: usize| async { Err::<tokio::io::DuplexStream, Error>(Error::BringupFailed("no endpoints configured")) };

        // Answers the AT handshake and the control channel's SABM, then goes
        // silent: pings sent afterwards never get a reply.
        let responder = tokio::spawn(async move {
            let mut scratch = [0u8; 256];
            let _ = serial_there.read(&mut scratch).await; // "AT\r\n"
            let _ = serial_there.write_all(b"OK\r\n").await;
            let _ = serial_there.read(&mut scratch).await; // "AT+CMUX=0\r\n"
            let _ = serial_there.write_all(b"OK\r\n").await;
            let _ = serial_there.read(&mut scratch).await; // SABM on channel 0
            let ua = frame::encode(0, &[], UA | PF, false, DEFAULT_MAX_FRAME_SIZE);
            let _ = serial_there.write_all(&ua).await;
            let _ = serial_there.read(&mut scratch).await; // absorb, then go quiet forever
            // Hold the handle open instead of dropping it: a dropped duplex
            // half reads as EOF on the peer side, which would surface as a
            // (wrong) fatal I/O error instead of an unanswered watchdog.
            std::future::pending::<()>().await;
        });

        let outcome = run_once(&mut serial_here, &mut endpoints, &mut factory, &config, &terminate_requested, || {}).await;
        match &outcome {
            Outcome::Fatal(e) => panic!("unexpected fatal outcome: {}", e),
            Outcome::Terminated => panic!("unexpected terminated outcome"),
            Outcome::RestartRequested => {}
        }
        responder.abort();
    }
}

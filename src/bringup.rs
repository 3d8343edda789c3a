//! The modem bringup sequence: the `AT` handshake, optional PIN, `AT+CMUX`
//! entry, and the initial SABM exchange that takes the line into frame mode.

use std::time::Duration;

use log::{debug, info, warn};
use nom::bytes::complete::take_until;
use nom::IResult;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout};

use crate::config::Config;
use crate::constants::*;
use crate::link;
use crate::Error;

const AT_TIMEOUT: Duration = Duration::from_secs(10);
const PIN_TIMEOUT: Duration = Duration::from_secs(20);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Whether a polled AT response buffer contains a terminal `OK` or `ERROR`.
#[derive(Debug, PartialEq, Eq)]
enum AtReply {
    Ok,
    Error,
}

/// Looks for `OK` or `ERROR` anywhere in `buf`, tolerating leading garbage —
/// a substring search, not an exact match, matching the original's `findInBuf`.
fn find_reply(buf: &[u8]) -> Option<AtReply> {
    fn find<'a>(buf: &'a [u8], needle: &str) -> IResult<&'a [u8], &'a [u8]> {
        take_until(needle)(buf)
    }

    if find(buf, "OK").is_ok() {
        Some(AtReply::Ok)
    } else if find(buf, "ERROR").is_ok() {
        Some(AtReply::Error)
    } else {
        None
    }
}

/// Sends `command` and polls `port` for an `OK`/`ERROR` reply until `budget`
/// elapses. Returns `Ok(true)` on `OK`, `Ok(false)` on `ERROR` or timeout.
async fn at_command<P>(port: &mut P, command: &[u8], budget: Duration) -> Result<bool, Error>
where
    P: AsyncReadExt + AsyncWriteExt + Unpin,
{
    port.write_all(command).await?;

    let mut accumulated = Vec::new();
    let mut scratch = [0u8; 256];

    let result = timeout(budget, async {
        loop {
            match port.read(&mut scratch).await {
                Ok(0) => return false,
                Ok(n) => {
                    accumulated.extend_from_slice(&scratch[..n]);
                    match find_reply(&accumulated) {
                        Some(AtReply::Ok) => return true,
                        Some(AtReply::Error) => return false,
                        None => sleep(POLL_INTERVAL).await,
                    }
                }
                Err(_) => sleep(POLL_INTERVAL).await,
            }
        }
    })
    .await;

    Ok(result.unwrap_or(false))
}

/// Runs the full bringup sequence on a raw (not-yet-framed) serial handle,
/// returning once the control and every user channel have completed SABM/UA.
pub async fn bring_up<P>(port: &mut P, config: &Config) -> Result<(), Error>
where
    P: AsyncReadExt + AsyncWriteExt + Unpin,
{
    if !at_command(port, b"AT\r\n", AT_TIMEOUT).await? {
        // The modem may already be sitting in mux mode from a previous run;
        // ask it to close down and try the handshake again.
        warn!("no AT response; sending close-down and retrying");
        port.write_all(&link::close_down_frame(config.max_frame_size)).await?;
        if !at_command(port, b"AT\r\n", AT_TIMEOUT).await? {
            return Err(Error::BringupFailed("modem did not respond to AT"));
        }
    }

    if config.pin_code > 0 {
        let command = format!("AT+CPIN={}\r\n", config.pin_code);
        if !at_command(port, command.as_bytes(), PIN_TIMEOUT).await? {
            return Err(Error::BringupFailed("AT+CPIN rejected"));
        }
    }

    let cmux_command = match config.baud_index() {
        Some(index) => format!("AT+CMUX=0,0,{}\r\n", index),
        None => "AT+CMUX=0\r\n".to_string(),
    };
    if !at_command(port, cmux_command.as_bytes(), AT_TIMEOUT).await? {
        return Err(Error::BringupFailed("AT+CMUX rejected"));
    }

    info!("modem entered CMUX mode, opening control channel");
    open_channel(port, 0, config.max_frame_size).await?;
    for channel in 1..=config.channel_count as u8 {
        debug!("opening channel {}", channel);
        open_channel(port, channel, config.max_frame_size).await?;
    }

    Ok(())
}

async fn open_channel<P>(port: &mut P, channel: u8, max_frame_size: usize) -> Result<(), Error>
where
    P: AsyncReadExt + AsyncWriteExt + Unpin,
{
    use crate::buffer::ReceiveBuffer;
    use crate::frame;

    let sabm = frame::encode(channel, &[], SABM | PF, true, max_frame_size);
    let mut buffer = ReceiveBuffer::new(4096);
    let mut scratch = [0u8; 256];

    port.write_all(&sabm).await?;

    let result = timeout(AT_TIMEOUT, async {
        loop {
            if let Some(f) = buffer.get_frame() {
                match f.control & !PF {
                    UA if f.address == channel => return Ok(()),
                    DM if f.address == channel => {
                        return Err(Error::BringupFailed("channel rejected with DM"))
                    }
                    _ => continue,
                }
            }
            match port.read(&mut scratch).await {
                Ok(0) => return Err(Error::BringupFailed("serial port closed during bringup")),
                Ok(n) => buffer.write(&scratch[..n]),
                Err(e) => return Err(Error::Io(e)),
            }
        }
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(_) => Err(Error::BringupFailed("timed out waiting for UA")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_ok_past_leading_garbage() {
        assert_eq!(find_reply(b"\r\nAT\r\r\nOK\r\n"), Some(AtReply::Ok));
    }

    #[test]
    fn finds_error() {
        assert_eq!(find_reply(b"\r\nERROR\r\n"), Some(AtReply::Error));
    }

    #[test]
    fn no_reply_yet() {
        assert_eq!(find_reply(b"\r\nAT\r"), None);
    }
}

//! Bridges endpoint byte streams and the multiplexed serial link: fragments
//! endpoint reads into UIH frames, and writes received payloads straight
//! through to their endpoint.

use log::warn;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::constants::{UIH, WRITE_RETRIES};
use crate::frame;
use crate::Error;

/// Size of the scratch buffer used to read one batch of endpoint bytes before
/// fragmenting it into frames.
pub const ENDPOINT_READ_SIZE: usize = 4096;

/// Fragments `data` into UIH frames of at most `max_frame_size` bytes each,
/// addressed to `channel`, and writes each to `serial`.
///
/// Each frame write is retried up to [`WRITE_RETRIES`] times on a short
/// write; a fragment that still can't be written whole is dropped and
/// logged, matching the original driver's behaviour, rather than aborting
/// the whole batch.
pub async fn send_fragments<W>(serial: &mut W, channel: u8, data: &[u8], max_frame_size: usize) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    for fragment in data.chunks(max_frame_size.max(1)) {
        let encoded = frame::encode(channel, fragment, UIH, true, max_frame_size);
        write_with_retries(serial, &encoded, channel).await?;
    }
    Ok(())
}

async fn write_with_retries<W>(serial: &mut W, encoded: &[u8], channel: u8) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let mut attempts = 0;
    let mut offset = 0;

    while offset < encoded.len() {
        match serial.write(&encoded[offset..]).await {
            Ok(0) => return Err(Error::Io(std::io::Error::new(std::io::ErrorKind::WriteZero, "serial write returned 0"))),
            Ok(n) => offset += n,
            Err(e) => return Err(Error::Io(e)),
        }

        if offset < encoded.len() {
            attempts += 1;
            if attempts >= WRITE_RETRIES {
                warn!("dropping fragment for channel {} after {} short writes", channel, WRITE_RETRIES);
                return Ok(());
            }
        }
    }

    Ok(())
}

/// Writes a received payload straight to its endpoint as a single write.
/// Endpoints are local pseudo-terminals, so short writes are not retried.
#[allow(clippy::unused_io_amount)]
pub async fn deliver_to_endpoint<W>(endpoint: &mut W, payload: &[u8]) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    endpoint.write(payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_MAX_FRAME_SIZE;
    use crate::frame::Decoded;

    #[tokio::test]
    async fn fragments_split_on_max_frame_size() {
        let mut serial = Vec::new();
        let data = vec![0xABu8; DEFAULT_MAX_FRAME_SIZE * 2 + 5];

        send_fragments(&mut serial, 1, &data, DEFAULT_MAX_FRAME_SIZE).await.unwrap();

        let mut remaining = &serial[..];
        let mut total = 0;
        while !remaining.is_empty() {
            match frame::decode_one(remaining) {
                Decoded::Frame { frame, consumed } => {
                    assert_eq!(frame.address, 1);
                    assert!(frame.payload.len() <= DEFAULT_MAX_FRAME_SIZE);
                    total += frame.payload.len();
                    remaining = &remaining[consumed..];
                }
                _ => panic!("expected a clean run of frames"),
            }
        }
        assert_eq!(total, data.len());
    }

    #[tokio::test]
    async fn deliver_writes_payload_verbatim() {
        let mut endpoint = Vec::new();
        deliver_to_endpoint(&mut endpoint, b"hello").await.unwrap();
        assert_eq!(endpoint, b"hello");
    }
}

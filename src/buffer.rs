//! The receive byte accumulator: tolerates partial reads, resynchronises on
//! frame flags, validates FCS via [`crate::frame`], and yields whole frames.

use bytes::BytesMut;

use crate::constants::F_FLAG;
use crate::frame::{self, Decoded, Frame};

/// Bounded byte accumulator fed raw bytes from the serial port.
pub struct ReceiveBuffer {
    data: BytesMut,
    capacity: usize,
    received_count: u64,
    dropped_count: u64,
}

impl ReceiveBuffer {
    /// Creates an empty buffer that will hold at most `capacity` unconsumed bytes.
    pub fn new(capacity: usize) -> Self {
        ReceiveBuffer {
            data: BytesMut::with_capacity(capacity),
            capacity,
            received_count: 0,
            dropped_count: 0,
        }
    }

    /// Bytes of headroom left before the buffer is full.
    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    /// Appends newly-read bytes. Silently truncates to `free()` bytes, since
    /// the supervisor loop always reads `min(buffer_free, scratch_size)`.
    pub fn write(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.free());
        self.data.extend_from_slice(&bytes[..n]);
    }

    /// Total frames successfully extracted since construction.
    pub fn received_count(&self) -> u64 {
        self.received_count
    }

    /// Total bytes discarded while resynchronising since construction.
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count
    }

    /// Scans for the next flag-delimited frame, validating it in place.
    ///
    /// Garbage ahead of a frame, two back-to-back flags (an empty inter-frame
    /// gap), and frames that fail FCS are all consumed and counted as
    /// dropped bytes. Returns `None` once the remaining buffer cannot yield a
    /// complete frame; in that state, no unconsumed bytes precede a
    /// recognisable frame start.
    pub fn get_frame(&mut self) -> Option<Frame> {
        loop {
            let flag_pos = self.data.iter().position(|&b| b == F_FLAG)?;
            if flag_pos > 0 {
                self.drop_bytes(flag_pos);
            }

            // Collapse a run of flags (including an empty inter-frame gap)
            // down to the last one, which is the real frame start candidate.
            while self.data.len() > 1 && self.data[1] == F_FLAG {
                self.drop_bytes(1);
            }

            if self.data.len() < 2 {
                return None;
            }

            match frame::decode_one(&self.data) {
                Decoded::Incomplete => return None,
                Decoded::Invalid { consumed } => self.drop_bytes(consumed),
                Decoded::Frame { frame, consumed } => {
                    // Leave the closing flag in place: it doubles as the next
                    // frame's opening flag when frames are back to back, and
                    // is absorbed by the flag-run collapse above otherwise.
                    self.data.advance_by(consumed - 1);
                    self.received_count += 1;
                    return Some(frame);
                }
            }
        }
    }

    fn drop_bytes(&mut self, n: usize) {
        self.data.advance_by(n);
        self.dropped_count += n as u64;
    }
}

/// Thin helper so `BytesMut::advance` reads naturally as "advance by".
trait AdvanceBy {
    fn advance_by(&mut self, n: usize);
}

impl AdvanceBy for BytesMut {
    fn advance_by(&mut self, n: usize) {
        let _ = self.split_to(n);
    }
}

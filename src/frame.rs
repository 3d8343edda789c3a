//! Encoding and single-frame decoding for 07.10 basic-option frames.
//!
//! This module is a pure codec: it neither scans for flag bytes across a
//! byte stream nor tracks counters. [`crate::buffer::ReceiveBuffer`] owns the
//! resynchronisation policy and calls [`decode_one`] once it has lined a
//! buffer up on a `0x7E`.

use bytes::{BufMut, BytesMut};

use crate::constants::*;
use crate::fcs;

/// A single decoded 07.10 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// DLCI / channel address, `0..=63`. Address 0 is the control channel.
    pub address: u8,
    /// Command/response bit from the address octet.
    pub cr: bool,
    /// The control octet with the P/F bit stripped.
    pub control: u8,
    /// Whether the P/F bit was set on the wire.
    pub poll_final: bool,
    /// The information field. Empty for frames without a payload.
    pub payload: BytesMut,
}

impl Frame {
    /// True if this frame's FCS is required to cover its payload (every frame
    /// type except UI and UIH, which checksum only the header).
    fn fcs_covers_payload(control: u8) -> bool {
        !matches!(control, UI | UIH)
    }
}

/// Encodes a frame for transmission. `payload` is truncated to `max_frame_size`
/// bytes, matching the original driver's `min(max_frame_size, count)` behaviour
/// rather than rejecting an oversized caller.
pub fn encode(channel: u8, payload: &[u8], control: u8, cr: bool, max_frame_size: usize) -> BytesMut {
    let payload = &payload[..payload.len().min(max_frame_size)];

    let mut address = EA | (channel & MAX_CHANNEL) << 2;
    if cr {
        address |= CR;
    }

    let mut header = BytesMut::with_capacity(4);
    header.put_u8(address);
    header.put_u8(control);
    if payload.len() > MAX_SINGLE_LENGTH_OCTET {
        header.put_u8(((payload.len() & 0x7F) << 1) as u8);
        header.put_u8(((payload.len() >> 7) & 0xFF) as u8);
    } else {
        header.put_u8(1 | ((payload.len() as u8) << 1));
    }

    let covers_payload = Frame::fcs_covers_payload(control);
    let mut covered = BytesMut::with_capacity(header.len() + if covers_payload { payload.len() } else { 0 });
    covered.extend_from_slice(&header);
    if covers_payload {
        covered.extend_from_slice(payload);
    }
    let fcs = fcs::compute(&covered);

    let mut out = BytesMut::with_capacity(header.len() + payload.len() + 3);
    out.put_u8(F_FLAG);
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    out.put_u8(fcs);
    out.put_u8(F_FLAG);
    out
}

/// Outcome of attempting to decode one frame starting at `buf[0]`, which must
/// be a `0x7E` flag octet.
pub enum Decoded {
    /// Not enough bytes yet to know whether this is a valid frame.
    Incomplete,
    /// The header was structurally invalid (EA violation) or the FCS did not
    /// check out. `consumed` bytes should be dropped and scanning resumed.
    Invalid { consumed: usize },
    /// A complete, checksum-valid frame. `consumed` is the total number of
    /// bytes (flag to flag, inclusive) making up the frame on the wire.
    Frame { frame: Frame, consumed: usize },
}

/// Attempts to decode a single frame from the front of `buf`.
///
/// `buf[0]` must be `F_FLAG`; callers (the receive buffer) are responsible for
/// locating that flag. A second, immediately-following `F_FLAG` is treated as
/// an empty inter-frame gap: callers should consume one byte and retry.
pub fn decode_one(buf: &[u8]) -> Decoded {
    debug_assert_eq!(buf.first().copied(), Some(F_FLAG));

    // address, control, at least one length octet, fcs, closing flag.
    const MIN_FRAME: usize = 1 + 1 + 1 + 1 + 1 + 1;
    if buf.len() < MIN_FRAME {
        return Decoded::Incomplete;
    }

    let address_byte = buf[1];
    if address_byte & EA == 0 {
        // Basic option never extends the address past one octet.
        return Decoded::Invalid { consumed: 1 };
    }
    let cr = address_byte & CR != 0;
    let address = (address_byte >> 2) & MAX_CHANNEL;
    let control = buf[2];

    let (length, length_octets) = if buf[3] & EA != 0 {
        ((buf[3] >> 1) as usize, 1)
    } else {
        if buf.len() < 5 {
            return Decoded::Incomplete;
        }
        let low = (buf[3] >> 1) as usize;
        let high = buf[4] as usize;
        (low | (high << 7), 2)
    };

    let header_len = 2 + length_octets;
    let frame_len = 1 + header_len + length + 1 + 1; // flag + header + payload + fcs + flag
    if buf.len() < frame_len {
        return Decoded::Incomplete;
    }

    let payload_start = 1 + header_len;
    let payload_end = payload_start + length;
    let payload = &buf[payload_start..payload_end];
    let received_fcs = buf[payload_end];
    if buf[payload_end + 1] != F_FLAG {
        return Decoded::Invalid { consumed: 1 };
    }

    let header = &buf[1..1 + header_len];
    let covers_payload = Frame::fcs_covers_payload(control & !PF);
    let mut covered = BytesMut::with_capacity(header.len() + if covers_payload { payload.len() } else { 0 });
    covered.extend_from_slice(header);
    if covers_payload {
        covered.extend_from_slice(payload);
    }

    if !fcs::is_valid(&covered, received_fcs) {
        return Decoded::Invalid { consumed: 1 };
    }

    let poll_final = control & PF != 0;
    Decoded::Frame {
        frame: Frame {
            address,
            cr,
            control: control & !PF,
            poll_final,
            payload: BytesMut::from(payload),
        },
        consumed: frame_len,
    }
}

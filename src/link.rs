//! The channel link engine: given one decoded frame, updates channel state
//! and decides what (if anything) the supervisor must send or do next.

use bytes::{BufMut, BytesMut};
use log::{debug, info, warn};

use crate::channel::ChannelTable;
use crate::constants::*;
use crate::frame::{self, Frame};

/// Payload of the multiplexer close-down command, sent as a UIH on channel 0.
pub const CLOSE_DOWN_PAYLOAD: [u8; 2] = [C_CLD | CR, EA];

/// What the supervisor should do in response to having handled one frame.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Bytes to write to the serial handle, if the frame warrants a reply.
    pub reply: Option<BytesMut>,
    /// A UI/UIH payload addressed to a user channel, to forward to its endpoint.
    pub deliver: Option<(u8, BytesMut)>,
    /// Set when the control channel has failed or peer-closed fatally.
    pub terminate: bool,
    /// Set when fault-tolerant mode should restart the link.
    pub restart: bool,
}

/// Applies one received frame to `channels`, returning the resulting [`Outcome`].
///
/// `fault_tolerant` governs whether a peer-initiated control-channel DISC
/// triggers a restart (true) or an immediate, fatal termination (false).
/// `send_version_probe` governs whether the UA that opens the control
/// channel is answered with the vendor version-test UIH (see
/// [`crate::constants::VERSION_PROBE_PAYLOAD`]).
pub fn handle_frame(channels: &mut ChannelTable, frame: &Frame, max_frame_size: usize, fault_tolerant: bool, send_version_probe: bool) -> Outcome {
    let address = frame.address;
    match frame.control {
        UI | UIH => handle_information(channels, address, &frame.payload),
        SABM => handle_sabm(channels, address, max_frame_size),
        UA => handle_ua(channels, address, max_frame_size, send_version_probe),
        DM => handle_dm(channels, address),
        DISC => handle_disc(channels, address, max_frame_size, fault_tolerant),
        other => {
            warn!("ignoring unrecognised control octet {:#04x} on channel {}", other, address);
            Outcome::default()
        }
    }
}

fn handle_information(channels: &mut ChannelTable, address: u8, payload: &BytesMut) -> Outcome {
    if address == 0 {
        debug!("control channel payload: {:02x?}", &payload[..]);
        return Outcome::default();
    }
    if !channels.is_open(address) {
        debug!("dropping payload for unopened channel {}", address);
        return Outcome::default();
    }
    Outcome {
        deliver: Some((address, payload.clone())),
        ..Outcome::default()
    }
}

fn handle_sabm(channels: &mut ChannelTable, address: u8, max_frame_size: usize) -> Outcome {
    if channels.is_open(address) {
        info!("SABM on already-open channel {} (idempotent)", address);
    }
    channels.set_open(address, true);
    Outcome {
        reply: Some(frame::encode(address, &[], UA | PF, false, max_frame_size)),
        ..Outcome::default()
    }
}

fn handle_ua(channels: &mut ChannelTable, address: u8, max_frame_size: usize, send_version_probe: bool) -> Outcome {
    if channels.is_open(address) {
        // Acknowledges a local DISC.
        channels.set_open(address, false);
        return Outcome::default();
    }

    // Acknowledges a local SABM.
    channels.set_open(address, true);
    if address == 0 && send_version_probe {
        return Outcome {
            reply: Some(frame::encode(0, &VERSION_PROBE_PAYLOAD, UIH, true, max_frame_size)),
            ..Outcome::default()
        };
    }
    Outcome::default()
}

fn handle_dm(channels: &mut ChannelTable, address: u8) -> Outcome {
    if channels.is_open(address) {
        channels.set_open(address, false);
        return Outcome::default();
    }
    if address == 0 {
        warn!("control channel rejected with DM; terminating");
        return Outcome {
            terminate: true,
            ..Outcome::default()
        };
    }
    warn!("channel {} could not be opened (DM)", address);
    Outcome::default()
}

fn handle_disc(channels: &mut ChannelTable, address: u8, max_frame_size: usize, fault_tolerant: bool) -> Outcome {
    if channels.is_open(address) {
        channels.set_open(address, false);
        let reply = Some(frame::encode(address, &[], UA | PF, false, max_frame_size));

        if address != 0 {
            info!("channel {} closed", address);
            return Outcome {
                reply,
                ..Outcome::default()
            };
        }

        return if fault_tolerant {
            info!("control channel closed; restarting");
            Outcome {
                reply,
                restart: true,
                ..Outcome::default()
            }
        } else {
            info!("control channel closed; terminating");
            Outcome {
                reply,
                terminate: true,
                ..Outcome::default()
            }
        };
    }

    warn!("DISC received on already-closed channel {}", address);
    Outcome {
        reply: Some(frame::encode(address, &[], DM | PF, false, max_frame_size)),
        ..Outcome::default()
    }
}

/// Encodes the multiplexer close-down command as a UIH frame on channel 0.
pub fn close_down_frame(max_frame_size: usize) -> BytesMut {
    frame::encode(0, &CLOSE_DOWN_PAYLOAD, UIH, true, max_frame_size)
}

/// Encodes a benign liveness ping (`#\tPING`) as a UIH frame on channel 0.
pub fn ping_frame(max_frame_size: usize) -> BytesMut {
    let mut payload = BytesMut::with_capacity(6);
    payload.put_slice(b"\x23\x09PING");
    frame::encode(0, &payload, UIH, true, max_frame_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &BytesMut) -> Frame {
        match frame::decode_one(bytes) {
            frame::Decoded::Frame { frame, .. } => frame,
            _ => panic!("expected a valid frame"),
        }
    }

    #[test]
    fn sabm_on_closed_channel_opens_and_replies_ua() {
        // S4: SABM from peer on channel 2 when closed.
        let mut channels = ChannelTable::new();
        let sabm = decode(&frame::encode(2, &[], SABM | PF, true, DEFAULT_MAX_FRAME_SIZE));

        let outcome = handle_frame(&mut channels, &sabm, DEFAULT_MAX_FRAME_SIZE, false, false);

        assert!(channels.is_open(2));
        let reply = decode(&outcome.reply.expect("UA reply"));
        assert_eq!(reply.address, 2);
        assert_eq!(reply.control, UA);
        assert!(reply.poll_final);
    }

    #[test]
    fn ua_for_local_sabm_opens_channel() {
        let mut channels = ChannelTable::new();
        let ua = decode(&frame::encode(1, &[], UA | PF, false, DEFAULT_MAX_FRAME_SIZE));
        let outcome = handle_frame(&mut channels, &ua, DEFAULT_MAX_FRAME_SIZE, false, false);
        assert!(channels.is_open(1));
        assert!(outcome.reply.is_none());
    }

    #[test]
    fn ua_for_local_disc_closes_channel() {
        let mut channels = ChannelTable::new();
        channels.set_open(1, true);
        let ua = decode(&frame::encode(1, &[], UA | PF, false, DEFAULT_MAX_FRAME_SIZE));
        handle_frame(&mut channels, &ua, DEFAULT_MAX_FRAME_SIZE, false, false);
        assert!(!channels.is_open(1));
    }

    #[test]
    fn ua_for_local_control_sabm_sends_version_probe_when_enabled() {
        let mut channels = ChannelTable::new();
        let ua = decode(&frame::encode(0, &[], UA | PF, false, DEFAULT_MAX_FRAME_SIZE));

        let outcome = handle_frame(&mut channels, &ua, DEFAULT_MAX_FRAME_SIZE, false, true);

        assert!(channels.is_open(0));
        let reply = decode(&outcome.reply.expect("version probe UIH"));
        assert_eq!(reply.address, 0);
        assert_eq!(reply.control, UIH);
        assert_eq!(&reply.payload[..], &VERSION_PROBE_PAYLOAD);
    }

    #[test]
    fn dm_on_control_channel_is_fatal() {
        let mut channels = ChannelTable::new();
        let dm = decode(&frame::encode(0, &[], DM | PF, false, DEFAULT_MAX_FRAME_SIZE));
        let outcome = handle_frame(&mut channels, &dm, DEFAULT_MAX_FRAME_SIZE, false, false);
        assert!(outcome.terminate);
    }

    #[test]
    fn disc_on_open_channel_closes_and_replies_ua() {
        let mut channels = ChannelTable::new();
        channels.set_open(3, true);
        let disc = decode(&frame::encode(3, &[], DISC | PF, true, DEFAULT_MAX_FRAME_SIZE));
        let outcome = handle_frame(&mut channels, &disc, DEFAULT_MAX_FRAME_SIZE, false, false);
        assert!(!channels.is_open(3));
        let reply = decode(&outcome.reply.expect("UA reply"));
        assert_eq!(reply.control, UA);
    }

    #[test]
    fn disc_on_closed_channel_replies_dm() {
        let mut channels = ChannelTable::new();
        let disc = decode(&frame::encode(5, &[], DISC | PF, true, DEFAULT_MAX_FRAME_SIZE));
        let outcome = handle_frame(&mut channels, &disc, DEFAULT_MAX_FRAME_SIZE, false, false);
        let reply = decode(&outcome.reply.expect("DM reply"));
        assert_eq!(reply.control, DM);
    }

    #[test]
    fn disc_on_control_channel_restarts_when_fault_tolerant() {
        let mut channels = ChannelTable::new();
        channels.set_open(0, true);
        let disc = decode(&frame::encode(0, &[], DISC | PF, true, DEFAULT_MAX_FRAME_SIZE));
        let outcome = handle_frame(&mut channels, &disc, DEFAULT_MAX_FRAME_SIZE, true, false);
        assert!(outcome.restart);
        assert!(!outcome.terminate);
    }

    #[test]
    fn disc_on_control_channel_terminates_otherwise() {
        let mut channels = ChannelTable::new();
        channels.set_open(0, true);
        let disc = decode(&frame::encode(0, &[], DISC | PF, true, DEFAULT_MAX_FRAME_SIZE));
        let outcome = handle_frame(&mut channels, &disc, DEFAULT_MAX_FRAME_SIZE, false, false);
        assert!(outcome.terminate);
        assert!(!outcome.restart);
    }

    #[test]
    fn information_payload_forwarded_only_when_open() {
        let mut channels = ChannelTable::new();
        let uih = decode(&frame::encode(1, b"hello", UIH, true, DEFAULT_MAX_FRAME_SIZE));

        let outcome = handle_frame(&mut channels, &uih, DEFAULT_MAX_FRAME_SIZE, false, false);
        assert!(outcome.deliver.is_none(), "closed channel must not deliver");

        channels.set_open(1, true);
        let outcome = handle_frame(&mut channels, &uih, DEFAULT_MAX_FRAME_SIZE, false, false);
        let (addr, payload) = outcome.deliver.expect("open channel delivers");
        assert_eq!(addr, 1);
        assert_eq!(&payload[..], b"hello");
    }

    #[test]
    fn close_down_frame_matches_wire_format() {
        let out = close_down_frame(DEFAULT_MAX_FRAME_SIZE);
        let f = decode(&out);
        assert_eq!(f.address, 0);
        assert_eq!(f.control, UIH);
        assert_eq!(&f.payload[..], &CLOSE_DOWN_PAYLOAD);
    }
}

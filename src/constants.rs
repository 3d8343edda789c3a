//! Wire-level constants for the GSM 07.10 (basic option) link layer.

/// The frame delimiter that opens and closes every frame on the wire.
pub const F_FLAG: u8 = 0x7Eu8;

/// Address-field extension bit. Always 1 in basic option (DLCIs fit in six bits).
pub const EA: u8 = 0x01u8;
/// Address-field command/response bit.
pub const CR: u8 = 0x02u8;

/// Poll/Final bit, OR'd into a control octet.
pub const PF: u8 = 0x10u8;

// Control-field frame types, with the P/F bit cleared.
pub const SABM: u8 = 0x2Fu8;
pub const UA: u8 = 0x63u8;
pub const DM: u8 = 0x0Fu8;
pub const DISC: u8 = 0x43u8;
pub const UIH: u8 = 0xEFu8;
pub const UI: u8 = 0x03u8;

/// Multiplexer close-down command octet, carried as a UIH payload on channel 0.
pub const C_CLD: u8 = 0xC3u8;

/// V.24 signal bits used to initialise a channel's `v24_signals` snapshot.
pub const S_DV: u8 = 1 << 2;
pub const S_RTR: u8 = 1 << 6;
pub const S_RTC: u8 = 1 << 1;

/// Maximum DLCI (channel address) representable in the 6-bit address field.
pub const MAX_CHANNEL: u8 = 63;

/// Upper bound on a single length octet before the two-octet form is required.
pub const MAX_SINGLE_LENGTH_OCTET: usize = 127;

/// Index-to-baud table used by `AT+CMUX=0,0,<index>`. Index 0 means "leave it alone".
pub const BAUD_TABLE: [u32; 8] = [0, 9600, 19200, 38400, 57600, 115200, 230400, 460800];

/// Maps a baud rate to its `AT+CMUX` index, falling back to 0 (auto) for unknown rates.
pub fn baud_index(baud: u32) -> u8 {
    BAUD_TABLE
        .iter()
        .position(|&b| b == baud)
        .unwrap_or(0) as u8
}

/// Default maximum information-field size, per the original implementation's default.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 31;

/// How many times a short write is retried at the frame level before the fragment is dropped.
pub const WRITE_RETRIES: u8 = 5;

/// Maximum number of logical (user) channels, matching `MAX_CHANNELS` in the original driver.
pub const MAX_CHANNELS: usize = 32;

/// The 18-byte vendor "version test" probe the original driver sends on
/// channel 0 once the control channel's UA comes back. Its semantics are
/// unspecified by the 07.10 standard; emitting it is opt-in.
pub const VERSION_PROBE_PAYLOAD: [u8; 18] = *b"#!\x04TEMUXVERSION2\0\0";

/// Errors returned from various operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] ::std::io::Error),

    /// The modem bringup sequence (`AT` handshake, PIN, `AT+CMUX`) did not complete.
    #[error("modem bringup failed: {0}")]
    BringupFailed(&'static str),

    /// A channel address outside `0..=63` was requested.
    #[error("invalid channel address {0}")]
    InvalidChannel(u8),

    /// A payload longer than the configured `max_frame_size` was handed to the encoder.
    #[error("payload of {0} bytes exceeds the configured max frame size")]
    PayloadTooLarge(usize),

    /// A configuration value was out of range or otherwise unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The peer rejected opening the control channel; the mux cannot continue.
    #[error("control channel could not be opened")]
    ControlChannelRejected,
}

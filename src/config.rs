//! Runtime configuration for the mux core, shared by the library and the
//! `gsmuxd` binary's CLI.

use crate::constants::{baud_index, DEFAULT_MAX_FRAME_SIZE, MAX_CHANNELS};
use crate::Error;

/// Tuning for the mux's supervisor loop, independent of how the serial port
/// and endpoints were actually opened.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum information-field length the encoder will emit.
    pub max_frame_size: usize,
    /// Line speed to request via `AT+CMUX`'s baud index; 0 leaves it alone.
    pub baud_rate: u32,
    /// SIM PIN to submit during bringup, `1..=9999`; 0 means none configured.
    pub pin_code: u32,
    /// Number of user channels (endpoints) to bring up, `1..=MAX_CHANNELS`.
    pub channel_count: usize,
    /// Enables the watchdog/ping/restart behaviour of the supervisor loop.
    pub fault_tolerant: bool,
    /// Sends a benign UIH probe on channel 0 once the control channel opens.
    /// Off by default: the original protocol does not require it and most
    /// modems never answer it usefully.
    pub send_version_probe: bool,
}

impl Config {
    /// Validates a configuration, mirroring the original driver's startup checks.
    pub fn validate(&self) -> Result<(), Error> {
        if self.channel_count == 0 || self.channel_count > MAX_CHANNELS {
            return Err(Error::InvalidConfig("channel_count must be between 1 and MAX_CHANNELS"));
        }
        if self.pin_code > 9999 {
            return Err(Error::InvalidConfig("pin_code must be at most 9999"));
        }
        Ok(())
    }

    /// The `AT+CMUX` baud index corresponding to `baud_rate`, or `None` if the
    /// line speed should be left untouched.
    pub fn baud_index(&self) -> Option<u8> {
        if self.baud_rate == 0 {
            None
        } else {
            Some(baud_index(self.baud_rate))
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            baud_rate: 0,
            pin_code: 0,
            channel_count: 1,
            fault_tolerant: false,
            send_version_probe: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_channels_rejected() {
        let mut config = Config::default();
        config.channel_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn pin_out_of_range_rejected() {
        let mut config = Config::default();
        config.pin_code = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_baud_means_unchanged() {
        assert_eq!(Config::default().baud_index(), None);
    }

    #[test]
    fn known_baud_maps_to_table_index() {
        let mut config = Config::default();
        config.baud_rate = 115_200;
        assert_eq!(config.baud_index(), Some(5));
    }
}

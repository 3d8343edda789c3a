use std::path::PathBuf;

use structopt::StructOpt;

/// `gsmuxd` — a GSM 07.10 (AT+CMUX) link-layer multiplexer daemon.
#[derive(StructOpt, Debug)]
#[structopt(name = "gsmuxd")]
pub struct Opt {
    /// Path to the serial device with the GSM modem attached, e.g. /dev/ttyUSB0
    #[structopt(short = "p", long = "device", parse(from_os_str))]
    pub device: PathBuf,

    /// Maximum information-field length the encoder will emit
    #[structopt(short, long, default_value = "31")]
    pub max_frame_size: usize,

    /// Line speed to request via AT+CMUX; 0 leaves the current speed alone
    #[structopt(short, long, default_value = "0")]
    pub baud: u32,

    /// SIM PIN to submit during bringup; 0 means none configured
    #[structopt(short = "P", long = "pin", default_value = "0")]
    pub pin: u32,

    /// Prefix for per-channel pty alias symlinks, e.g. /dev/mux yields /dev/mux0, /dev/mux1, ...
    #[structopt(short, long)]
    pub symlink_prefix: Option<String>,

    /// Enables the watchdog: restarts the link after missed pings or a peer-initiated close
    #[structopt(short = "r", long)]
    pub fault_tolerant: bool,

    /// Stays in the foreground and enables verbose logging
    #[structopt(short, long)]
    pub debug: bool,

    /// Blocks the invoking process until bringup has succeeded or failed
    #[structopt(short, long)]
    pub wait: bool,

    /// Endpoint device paths, one per channel. Use `/dev/ptmx` to allocate a
    /// fresh pseudo-terminal (aliased via --symlink-prefix if given), or an
    /// existing pty slave/character device path to attach to it directly.
    #[structopt(name = "ENDPOINT", required = true, parse(from_os_str))]
    pub endpoints: Vec<PathBuf>,
}

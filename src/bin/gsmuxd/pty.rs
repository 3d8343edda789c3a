//! Opens the local endpoint devices and wraps their fd so the supervisor
//! loop can read/write them cooperatively, without a background thread pool.
//!
//! An endpoint configured as `/dev/ptmx` gets a freshly allocated Unix98
//! pseudo-terminal, symlink-aliased if requested; any other path is opened
//! directly, matching the original driver's `open_pty()`.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use log::warn;
use nix::fcntl::{open, OFlag};
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::stat::Mode;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
use std::os::fd::OwnedFd;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const PTMX_PATH: &str = "/dev/ptmx";

/// A local endpoint's fd, registered with tokio's reactor.
pub struct Endpoint {
    fd: AsyncFd<OwnedFd>,
    /// The slave device path local applications should open, when this
    /// endpoint is a freshly allocated pty (i.e. the configured path was
    /// `/dev/ptmx`). `None` for endpoints opened directly.
    slave_path: Option<String>,
}

impl Endpoint {
    pub fn slave_path(&self) -> Option<&str> {
        self.slave_path.as_deref()
    }
}

/// Opens one configured endpoint path, matching the original's `open_pty`.
pub fn open_endpoint(path: &Path) -> nix::Result<Endpoint> {
    if path == Path::new(PTMX_PATH) {
        allocate_pty()
    } else {
        open_existing(path)
    }
}

fn allocate_pty() -> nix::Result<Endpoint> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NONBLOCK)?;
    grantpt(&master)?;
    unlockpt(&master)?;
    let slave_path = ptsname_r(&master)?;
    set_raw_mode(&master)?;

    Ok(Endpoint {
        fd: AsyncFd::new(master.into()).expect("registering a fresh pty master with the reactor"),
        slave_path: Some(slave_path),
    })
}

fn open_existing(path: &Path) -> nix::Result<Endpoint> {
    let fd = open(path, OFlag::O_RDWR | OFlag::O_NONBLOCK, Mode::empty())?;
    set_raw_mode(&fd)?;

    Ok(Endpoint {
        fd: AsyncFd::new(fd).expect("registering an endpoint fd with the reactor"),
        slave_path: None,
    })
}

fn set_raw_mode<Fd: std::os::fd::AsFd>(fd: &Fd) -> nix::Result<()> {
    let mut termios = tcgetattr(fd)?;
    cfmakeraw(&mut termios);
    tcsetattr(fd, SetArg::TCSANOW, &termios)
}

/// Creates (replacing any stale target) a symlink `<prefix><index>` pointing
/// at `endpoint`'s slave device. A no-op for endpoints opened directly.
pub fn create_alias(prefix: &str, index: usize, endpoint: &Endpoint) -> io::Result<Option<PathBuf>> {
    let Some(slave_path) = endpoint.slave_path() else {
        return Ok(None);
    };
    let alias = PathBuf::from(format!("{}{}", prefix, index));
    remove_alias(&alias);
    std::os::unix::fs::symlink(slave_path, &alias)?;
    Ok(Some(alias))
}

/// Removes a previously-created alias, if any. Never fails loudly: a missing
/// symlink on shutdown or before a restart is expected, not an error.
pub fn remove_alias(alias: &Path) {
    if let Err(e) = std::fs::remove_file(alias) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("could not remove stale symlink {}: {}", alias.display(), e);
        }
    }
}

impl AsyncRead for Endpoint {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let mut guard = match this.fd.poll_read_ready_mut(cx) {
                Poll::Ready(g) => g?,
                Poll::Pending => return Poll::Pending,
            };

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| nix::unistd::read(inner.get_ref(), unfilled).map_err(io::Error::from)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for Endpoint {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            let mut guard = match this.fd.poll_write_ready_mut(cx) {
                Poll::Ready(g) => g?,
                Poll::Pending => return Poll::Pending,
            };

            match guard.try_io(|inner| nix::unistd::write(inner.get_ref(), buf).map_err(io::Error::from)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

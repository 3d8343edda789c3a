//! Forks into the background and detaches from the controlling terminal,
//! mirroring the original driver's `daemonize()`: a `SIGHUP`-based handshake
//! lets the parent report whether bringup actually succeeded before it exits.

use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{chdir, close, fork, getpid, setsid, ForkResult, Pid};

/// What the running process should do once `daemonize` returns: it always
/// returns in the (new) child; the parent exits from within the call.
pub struct Daemon {
    parent_pid: Option<Pid>,
}

impl Daemon {
    /// Signals the waiting parent that bringup succeeded, letting it exit 0.
    /// A no-op if nobody asked to wait (`-w`/`--wait` was not given).
    pub fn notify_ready(&self) {
        if let Some(pid) = self.parent_pid {
            let _ = kill(pid, Signal::SIGHUP);
        }
    }
}

extern "C" fn exit_success(_: i32) {
    std::process::exit(0);
}

/// Forks and detaches, unless `debug` keeps the process in the foreground.
///
/// When `wait_for_ready` is set, the parent blocks until the child either
/// signals success (`SIGHUP`) or exits on its own (bringup failure), instead
/// of returning to the shell immediately. This is why the second,
/// zombie-avoiding fork below only happens when nobody is waiting on us: a
/// waiting parent already knows our pid and needs it to stay valid to signal.
pub fn daemonize(debug: bool, wait_for_ready: bool) -> nix::Result<Option<Daemon>> {
    if debug {
        return Ok(None);
    }

    // SAFETY: installed before forking, while still single-threaded.
    unsafe { signal(Signal::SIGHUP, SigHandler::Handler(exit_success))? };
    let parent_pid = getpid();

    // SAFETY: no other threads exist at this point in `main`.
    match unsafe { fork()? } {
        ForkResult::Parent { child } => {
            if wait_for_ready {
                let _ = waitpid(child, None);
                eprintln!("gsmuxd: startup failed, see the log for details");
                std::process::exit(1);
            }
            std::process::exit(0);
        }
        ForkResult::Child => {}
    }

    setsid()?;

    if !wait_for_ready {
        // SAFETY: still single-threaded in the new session leader.
        if let ForkResult::Parent { .. } = unsafe { fork()? } {
            std::process::exit(0);
        }
    }

    chdir("/")?;
    for fd in 0..3 {
        let _ = close(fd);
    }

    Ok(Some(Daemon {
        parent_pid: wait_for_ready.then_some(parent_pid),
    }))
}

//! CGI child processes
//!
//! A CGI child is started with its stdin and stdout connected to pipes. The
//! reactor keeps the two parent ends (both non-blocking, close-on-exec) and
//! forgets the child; exited children are collected later by
//! [`reap_children`].

use std::ffi::OsStr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::os::fd::RawFd;
use std::process::{Child, Command, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use pollserv_core::{ServerError, ServerResult};

use crate::sys::set_nonblocking;

/// A running CGI child and the parent ends of its pipes
#[derive(Debug)]
pub struct CgiProcess {
    pub pid: u32,
    /// Child stdout; the reactor reads the response from here
    pub response_read: OwnedFd,
    /// Child stdin; the request body is written here
    pub request_write: OwnedFd,
}

fn spawn_error(err: std::io::Error) -> ServerError {
    ServerError::CgiSpawn(err.raw_os_error().unwrap_or(libc::EIO))
}

/// Start `program` with `args` and exactly the environment `env`.
///
/// `cwd`, when given, becomes the child's working directory. The child's
/// stderr is inherited.
pub fn spawn_child_process<I, K, V>(
    program: &Path,
    args: &[&OsStr],
    env: I,
    cwd: Option<&Path>,
) -> ServerResult<CgiProcess>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let child = command.spawn().map_err(spawn_error)?;
    into_process(child, set_nonblocking)
}

/// Take the parent pipe ends out of `child` and run `prepare` on each.
///
/// On failure the child is killed and collected before returning.
fn into_process(mut child: Child, prepare: fn(RawFd) -> std::io::Result<()>) -> ServerResult<CgiProcess> {
    let pid = child.id();
    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        abandon(&mut child);
        return Err(ServerError::CgiSpawn(libc::EPIPE));
    };
    let request_write = OwnedFd::from(stdin);
    let response_read = OwnedFd::from(stdout);
    if let Err(e) = prepare(request_write.as_raw_fd()).and_then(|()| prepare(response_read.as_raw_fd())) {
        abandon(&mut child);
        return Err(spawn_error(e));
    }

    // Dropping `child` neither waits nor kills.
    Ok(CgiProcess { pid, response_read, request_write })
}

fn abandon(child: &mut Child) {
    if child.kill().is_ok() {
        child.wait().ok();
    }
}

/// SIGKILL a CGI child. A child that already exited is not an error.
pub fn kill_child(pid: u32) -> ServerResult<()> {
    let Ok(raw) = i32::try_from(pid) else {
        return Err(ServerError::CgiKill { pid, errno: libc::EINVAL });
    };
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(ServerError::CgiKill { pid, errno: errno as i32 }),
    }
}

/// Collect every exited child without blocking. Returns how many.
pub fn reap_children() -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(_) => reaped += 1,
        }
    }
    reaped
}

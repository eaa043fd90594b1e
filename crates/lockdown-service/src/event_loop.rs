use std::io::{self, BufRead, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use anyhow::{Context, Result};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::signal;
use tracing::{debug, info, warn};

use crate::admin::{AdminConsole, Flow};
use crate::engine::Engine;
use crate::watch::inotify::{Inotify, EVENT_BUF_LEN};

const INPUT_BUF_LEN: usize = 4096;

/// Standard input switched to non-blocking mode so it can share one
/// readiness loop with the inotify descriptor. The previous file status
/// flags are restored on drop.
struct NonBlockingStdin {
    saved_flags: libc::c_int,
}

impl NonBlockingStdin {
    fn new() -> io::Result<Self> {
        let flags = unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { saved_flags: flags })
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::read(
                libc::STDIN_FILENO,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl AsRawFd for NonBlockingStdin {
    fn as_raw_fd(&self) -> RawFd {
        libc::STDIN_FILENO
    }
}

impl Drop for NonBlockingStdin {
    fn drop(&mut self) {
        unsafe {
            libc::fcntl(libc::STDIN_FILENO, libc::F_SETFL, self.saved_flags);
        }
    }
}

/// Reassembles command lines from arbitrary read chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append bytes and return every line they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        lines
    }

    /// The unterminated tail left at end of input, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&tail).into_owned())
    }
}

fn dispatch_lines(
    engine: &mut Engine,
    console: &mut AdminConsole,
    out: &mut impl Write,
    lines: impl IntoIterator<Item = String>,
) -> io::Result<Flow> {
    for line in lines {
        if console.handle_line(engine, &line, out)? == Flow::Stop {
            return Ok(Flow::Stop);
        }
    }
    Ok(Flow::Continue)
}

/// Multiplex administrative input and change notifications until `stop`
/// or Ctrl-C, then release every lock.
pub async fn run(engine: &mut Engine, inotify: Inotify) -> Result<()> {
    let inotify = AsyncFd::with_interest(inotify, Interest::READABLE)
        .context("failed to register inotify descriptor with the runtime")?;
    let mut console = AdminConsole::new();
    let mut stdout = io::stdout();
    let mut events = vec![0u8; EVENT_BUF_LEN];
    let mut input = vec![0u8; INPUT_BUF_LEN];
    let mut lines = LineBuffer::default();

    console.print_help(&mut stdout)?;

    let mut stdin = match NonBlockingStdin::new()
        .and_then(|s| AsyncFd::with_interest(s, Interest::READABLE))
    {
        Ok(fd) => Some(fd),
        Err(e) => {
            // regular files and /dev/null cannot be polled, and never block
            debug!(error = %e, "command input is not pollable, reading it up front");
            let pending = io::stdin().lock().lines().map_while(|l| l.ok());
            if dispatch_lines(engine, &mut console, &mut stdout, pending)? == Flow::Stop {
                engine.shutdown();
                return Ok(());
            }
            info!("command channel closed, enforcement continues until interrupted");
            None
        }
    };

    loop {
        tokio::select! {
            ready = async {
                match &stdin {
                    Some(fd) => fd.readable().await,
                    None => std::future::pending().await,
                }
            } => {
                let mut guard = ready.context("command channel failed")?;
                let read = match guard.try_io(|inner| inner.get_ref().read(&mut input)) {
                    Ok(read) => read,
                    Err(_would_block) => continue,
                };
                drop(guard);
                match read {
                    Ok(0) => {
                        info!("command channel closed, enforcement continues until interrupted");
                        stdin = None;
                        if dispatch_lines(engine, &mut console, &mut stdout, lines.finish())? == Flow::Stop {
                            break;
                        }
                    }
                    Ok(n) => {
                        let complete = lines.push(&input[..n]);
                        if dispatch_lines(engine, &mut console, &mut stdout, complete)? == Flow::Stop {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to read command channel");
                        stdin = None;
                    }
                }
            }
            ready = inotify.readable() => {
                let mut guard = ready.context("inotify descriptor failed")?;
                let batch = match guard.try_io(|inner| inner.get_ref().read_events(&mut events)) {
                    Ok(result) => result.context("failed to read change notifications")?,
                    Err(_would_block) => continue,
                };
                for event in batch {
                    let outcome = engine.handle_event(inotify.get_ref(), event);
                    if let Some(message) = outcome.user_message() {
                        println!("{message}");
                    }
                }
            }
            _ = signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
        }
    }

    engine.shutdown();
    Ok(())
}

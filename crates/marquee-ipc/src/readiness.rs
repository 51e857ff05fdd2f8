//! Blocking readiness waits on pipe endpoints.
//!
//! IO threads park in `poll(2)` on the pipe they serve plus a private wake
//! pipe. Waking writes to (and closes) the wake pipe, which makes every
//! parked wait return `Readiness::Woken`.

use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// OS handle that can be waited on.
pub trait Endpoint: AsRawFd {}

impl<T: AsRawFd + ?Sized> Endpoint for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The endpoint can make progress (or has hung up; the next call reports it).
    Ready,
    /// `Waker::wake` was called.
    Woken,
}

#[derive(Debug)]
pub struct Waker {
    reader: os_pipe::PipeReader,
    writer: Mutex<Option<os_pipe::PipeWriter>>,
    woken: AtomicBool,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = os_pipe::pipe()?;
        Ok(Self {
            reader,
            writer: Mutex::new(Some(writer)),
            woken: AtomicBool::new(false),
        })
    }

    /// Releases every current and future wait. Idempotent.
    pub fn wake(&self) {
        self.woken.store(true, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().take() {
            let _ = writer.write_all(&[1]);
        }
    }

    pub fn is_woken(&self) -> bool {
        self.woken.load(Ordering::SeqCst)
    }

    /// Blocks until `endpoint` is ready for `interest` or the waker fires.
    pub fn wait<E: Endpoint + ?Sized>(
        &self,
        endpoint: &E,
        interest: Interest,
    ) -> io::Result<Readiness> {
        if self.is_woken() {
            return Ok(Readiness::Woken);
        }

        let events = match interest {
            Interest::Read => libc::POLLIN,
            Interest::Write => libc::POLLOUT,
        };
        let mut fds = [
            libc::pollfd {
                fd: endpoint.as_raw_fd(),
                events,
                revents: 0,
            },
            libc::pollfd {
                fd: self.reader.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        loop {
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if fds[1].revents != 0 || self.is_woken() {
                return Ok(Readiness::Woken);
            }
            if fds[0].revents != 0 {
                return Ok(Readiness::Ready);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn readable_pipe_reports_ready() {
        let (reader, mut writer) = os_pipe::pipe().unwrap();
        writer.write_all(b"x").unwrap();
        let waker = Waker::new().unwrap();
        assert_eq!(waker.wait(&reader, Interest::Read).unwrap(), Readiness::Ready);
    }

    #[test]
    fn empty_pipe_writer_is_writable() {
        let (_reader, writer) = os_pipe::pipe().unwrap();
        let waker = Waker::new().unwrap();
        assert_eq!(waker.wait(&writer, Interest::Write).unwrap(), Readiness::Ready);
    }

    #[test]
    fn wake_releases_a_parked_reader() {
        let (reader, _writer) = os_pipe::pipe().unwrap();
        let waker = Arc::new(Waker::new().unwrap());

        let parked = {
            let waker = Arc::clone(&waker);
            thread::spawn(move || waker.wait(&reader, Interest::Read).unwrap())
        };

        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        waker.wake();
        assert_eq!(parked.join().unwrap(), Readiness::Woken);
        assert!(started.elapsed() < Duration::from_secs(1));

        // Later waits return immediately.
        let (reader, _writer) = os_pipe::pipe().unwrap();
        assert_eq!(waker.wait(&reader, Interest::Read).unwrap(), Readiness::Woken);
    }
}

//! Reactor: epoll readiness for connections and listeners
//!
//! Design: registrations are one-shot. Arming inserts the target under its
//! token and (re)enables the descriptor; whichever of the reactor thread and
//! [`Reactor::disarm`] removes the registration first owns the wake-up and
//! the task reference that came with it.

use super::connection::Interest;
use super::driver;
use super::server::Listener;
use super::Entry;
use crate::context::Task;
use crate::runtime::worker::Job;
use crate::runtime::Shared;
use dashmap::DashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const WAKE_TOKEN: u64 = u64::MAX;
const MAX_EVENTS: usize = 64;
const POLL_TIMEOUT_MS: i32 = 100;

/// What an armed registration wakes.
pub(crate) enum Target {
    Conn(Arc<Task>),
    Listener(Arc<Listener>),
}

impl Interest {
    fn to_epoll_events(self) -> u32 {
        let base = match self {
            Interest::Read => libc::EPOLLIN | libc::EPOLLRDHUP,
            Interest::Write => libc::EPOLLOUT,
        };
        (base | libc::EPOLLONESHOT) as u32
    }
}

pub(crate) struct Reactor {
    epoll_fd: RawFd,
    wake_fd: RawFd,
    registrations: DashMap<u64, Target>,
    shutdown: AtomicBool,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(err);
        }

        Ok(Self {
            epoll_fd,
            wake_fd,
            registrations: DashMap::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Wake `target` once `fd` is ready for `interest`.
    pub fn arm(&self, token: u64, fd: RawFd, interest: Interest, target: Target) -> io::Result<()> {
        self.registrations.insert(token, target);

        let mut ev = libc::epoll_event {
            events: interest.to_epoll_events(),
            u64: token,
        };
        let mut ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        if ret < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::ENOENT) {
            ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        }
        if ret < 0 {
            let err = io::Error::last_os_error();
            self.registrations.remove(&token);
            return Err(err);
        }
        Ok(())
    }

    /// Take an armed registration back; `None` if it already fired.
    pub fn disarm(&self, token: u64, fd: RawFd) -> Option<Target> {
        let (_, target) = self.registrations.remove(&token)?;
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // ENOENT / EBADF: the descriptor is already gone.
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF) {
                tracing::warn!(target: "net", token, %err, "epoll_ctl(DEL) failed");
            }
        }
        Some(target)
    }

    pub fn armed(&self) -> usize {
        self.registrations.len()
    }

    /// Wait up to `timeout_ms` and claim the registrations that fired.
    pub fn poll_once(&self, timeout_ms: i32) -> io::Result<Vec<Target>> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let n = unsafe { libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut fired = Vec::with_capacity(n as usize);
        for event in &events[..n as usize] {
            let token = event.u64;
            if token == WAKE_TOKEN {
                let mut buf = [0u8; 8];
                unsafe {
                    libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                }
                continue;
            }
            if let Some((_, target)) = self.registrations.remove(&token) {
                fired.push(target);
            }
        }
        Ok(fired)
    }

    pub fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake();
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.registrations.clear();
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}

/// Start the reactor thread; fired registrations become worker jobs.
pub(crate) fn spawn(shared: Arc<Shared>, reactor: Arc<Reactor>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("pxengine-reactor".to_string())
        .spawn(move || {
            tracing::debug!(target: "net", "reactor started");
            while !reactor.should_shutdown() {
                match reactor.poll_once(POLL_TIMEOUT_MS) {
                    Ok(fired) => {
                        for target in fired {
                            match target {
                                Target::Conn(task) => driver::post(&shared, task, Entry::Ready),
                                Target::Listener(listener) => shared.send_job(Job::Accept(listener)),
                            }
                        }
                    }
                    Err(err) => {
                        tracing::error!(target: "net", %err, "epoll_wait failed");
                        thread::sleep(std::time::Duration::from_millis(POLL_TIMEOUT_MS as u64));
                    }
                }
            }
            tracing::debug!(target: "net", "reactor stopped");
        })
}

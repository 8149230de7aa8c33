use std::io;
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};
use crate::net::handle::OwnedHandle;

/// A tiny hand-rolled stand-in for the `bitflags` crate: this module needs exactly two
/// small flag sets and pulling in a dependency for `|`/`contains` isn't worth it.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
        pub struct $name($repr);

        impl $name {
            $(pub const $variant: $name = $name($value);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn bits(self) -> $repr {
                self.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: Self) -> Self {
                $name(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

bitflags_like! {
    /// Interest/readiness mask. Only READ and WRITE are ever registered; ERROR and HUP are
    /// delivered by the kernel unconditionally and surface on whatever events come back.
    pub struct Interest: u32 {
        const READ = 0b0001;
        const WRITE = 0b0010;
    }
}

bitflags_like! {
    pub struct Readiness: u32 {
        const READ = 0b0001;
        const WRITE = 0b0010;
        const ERROR = 0b0100;
        const HUP = 0b1000;
    }
}

/// One readiness notification: the descriptor it's for, and which of READ/WRITE/ERROR/HUP fired.
#[derive(Copy, Clone, Debug)]
pub struct Event {
    pub fd: RawFd,
    pub mask: Readiness,
}

fn interest_to_epoll_events(interest: Interest) -> u32 {
    // Edge-triggered always; level-triggered would re-deliver READ/WRITE on every wait()
    // even though nothing new arrived, which defeats the drain-to-EAGAIN discipline.
    let mut events = libc::EPOLLET as u32;
    if interest.contains(Interest::READ) {
        events |= libc::EPOLLIN as u32;
    }
    if interest.contains(Interest::WRITE) {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn epoll_events_to_readiness(events: u32) -> Readiness {
    let mut mask = Readiness::empty();
    if events & (libc::EPOLLIN as u32) != 0 {
        mask |= Readiness::READ;
    }
    if events & (libc::EPOLLOUT as u32) != 0 {
        mask |= Readiness::WRITE;
    }
    if events & (libc::EPOLLERR as u32) != 0 {
        mask |= Readiness::ERROR;
    }
    if events & (libc::EPOLLHUP as u32) != 0 || events & (libc::EPOLLRDHUP as u32) != 0 {
        mask |= Readiness::HUP;
    }
    mask
}

/// Wraps a Linux `epoll` instance: register/modify/unregister descriptors with an
/// edge-triggered interest mask, and block for a batch of readiness events.
pub struct Reactor {
    epoll_fd: OwnedHandle,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(Error::from(io::Error::last_os_error()));
        }
        Ok(Reactor {
            epoll_fd: OwnedHandle::new(fd),
        })
    }

    pub fn register(&self, fd: RawFd, interest: Interest) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    /// Removing an fd that was never registered, or was already closed (the kernel drops
    /// epoll registrations automatically on close), is not an error.
    pub fn unregister(&self, fd: RawFd) {
        unsafe {
            libc::epoll_ctl(self.epoll_fd.raw(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: interest_to_epoll_events(interest),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd.raw(), op, fd, &mut ev) };
        if ret < 0 {
            return Err(Error::from(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Blocks until at least one event is ready (or a signal interrupts the wait, which is
    /// retried transparently), filling `out_events` with up to `out_events.len()` events and
    /// returning how many were delivered. May return 0 on a spurious wakeup.
    pub fn wait(&self, out_events: &mut [Event], max_events: usize) -> Result<usize> {
        let max_events = max_events.min(out_events.len());
        let mut raw = vec![libc::epoll_event { events: 0, u64: 0 }; max_events];
        loop {
            let n = unsafe {
                libc::epoll_wait(self.epoll_fd.raw(), raw.as_mut_ptr(), max_events as i32, -1)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::from(err));
            }
            for i in 0..n as usize {
                out_events[i] = Event {
                    fd: raw[i].u64 as RawFd,
                    mask: epoll_events_to_readiness(raw[i].events),
                };
            }
            return Ok(n as usize);
        }
    }
}

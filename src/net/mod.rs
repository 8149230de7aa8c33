mod handle;
mod reactor;

pub use handle::OwnedHandle;
pub use reactor::{Event, Interest, Readiness, Reactor};

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

/// Sets `O_NONBLOCK` on `fd`.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(Error::from(io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::from(io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Creates, binds and listens on a non-blocking IPv4 TCP socket with `SO_REUSEADDR` set,
/// backlog `SOMAXCONN`.
pub fn listen(port: u16) -> Result<OwnedHandle> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(Error::from(io::Error::last_os_error()));
        }
        let handle = OwnedHandle::new(fd);

        let optval: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of_val(&optval) as libc::socklen_t,
        ) < 0
        {
            return Err(Error::from(io::Error::last_os_error()));
        }

        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        let sockaddr = to_sockaddr_in(&addr);
        if libc::bind(
            fd,
            &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            return Err(Error::from(io::Error::last_os_error()));
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            return Err(Error::from(io::Error::last_os_error()));
        }

        set_nonblocking(fd)?;
        Ok(handle)
    }
}

/// Accepts one pending connection on `listen_fd`, non-blocking. Returns `Ok(None)` on
/// EAGAIN/EWOULDBLOCK (the drain-loop terminator), retries transparently on EINTR. The
/// returned socket is itself set non-blocking before being handed back.
pub fn accept(listen_fd: RawFd) -> Result<Option<(OwnedHandle, SocketAddrV4)>> {
    loop {
        let mut storage: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept(
                listen_fd,
                &mut storage as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd >= 0 {
            let handle = OwnedHandle::new(fd);
            set_nonblocking(fd)?;
            let addr = from_sockaddr_in(&storage);
            return Ok(Some((handle, addr)));
        }
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock => Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => Err(Error::from(err)),
        };
    }
}

/// Opens a non-blocking TCP connection to `(host, port)`. The connect is attempted as a
/// blocking call: the upstream is expected to be reachable quickly (typically the same host
/// or datacenter), and the baseline spec has no connect-timeout requirement.
pub fn connect(host: Ipv4Addr, port: u16) -> Result<OwnedHandle> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(Error::from(io::Error::last_os_error()));
        }
        let handle = OwnedHandle::new(fd);
        let addr = SocketAddrV4::new(host, port);
        let sockaddr = to_sockaddr_in(&addr);
        if libc::connect(
            fd,
            &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            return Err(Error::from(io::Error::last_os_error()));
        }
        set_nonblocking(fd)?;
        Ok(handle)
    }
}

fn to_sockaddr_in(addr: &SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
        #[cfg(target_os = "macos")]
        sin_len: 0,
    }
}

fn from_sockaddr_in(s: &libc::sockaddr_in) -> SocketAddrV4 {
    let ip = Ipv4Addr::from(u32::from_ne_bytes(s.sin_addr.s_addr.to_ne_bytes()));
    SocketAddrV4::new(ip, u16::from_be(s.sin_port))
}

/// Performs a single non-blocking `read(2)` into `buf`, returning the number of bytes read
/// or `None` on EOF. `EAGAIN`/`EWOULDBLOCK` surfaces as an `io::ErrorKind::WouldBlock` error
/// and `EINTR` as `Interrupted`, so callers can match on `Error::is_would_block`/`is_interrupted`.
pub fn recv(fd: RawFd, buf: &mut [u8]) -> Result<Option<usize>> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n > 0 {
        return Ok(Some(n as usize));
    }
    if n == 0 {
        return Ok(None);
    }
    Err(Error::from(io::Error::last_os_error()))
}

/// Performs a single non-blocking `send(2)` with `MSG_NOSIGNAL`, so a peer reset (`EPIPE`)
/// surfaces as an error instead of raising `SIGPIPE` for the whole process.
pub fn send(fd: RawFd, buf: &[u8]) -> Result<usize> {
    let n = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if n >= 0 {
        return Ok(n as usize);
    }
    Err(Error::from(io::Error::last_os_error()))
}

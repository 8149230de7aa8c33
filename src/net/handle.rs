use std::os::unix::io::RawFd;

/// Sentinel for "no descriptor owned". Never a valid fd returned by the kernel.
const SENTINEL: RawFd = -1;

/// Exclusive, move-only ownership of a raw OS descriptor.
///
/// Closes the descriptor exactly once, on drop or on an explicit `close()`. Moving out of
/// an `OwnedHandle` (or calling `close`/`take`) leaves it holding `SENTINEL`, so double-close
/// can't happen even if the handle is dropped again afterwards.
#[derive(Debug)]
pub struct OwnedHandle(RawFd);

impl OwnedHandle {
    /// Takes ownership of `fd`. `fd` must either be `SENTINEL` or a live, exclusively-owned descriptor.
    pub fn new(fd: RawFd) -> Self {
        OwnedHandle(fd)
    }

    pub fn invalid() -> Self {
        OwnedHandle(SENTINEL)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != SENTINEL
    }

    /// The raw descriptor, for passing to syscalls. Still owned by this handle.
    pub fn raw(&self) -> RawFd {
        self.0
    }

    /// Closes the descriptor now rather than on drop. A no-op if already closed.
    pub fn close(&mut self) {
        if self.0 != SENTINEL {
            unsafe {
                libc::close(self.0);
            }
            self.0 = SENTINEL;
        }
    }

    /// Releases ownership without closing, returning the raw descriptor. The caller
    /// becomes responsible for it.
    pub fn take(&mut self) -> RawFd {
        let fd = self.0;
        self.0 = SENTINEL;
        fd
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // Close errors are swallowed: there's nothing a destructor can do about them,
        // and a retry loop here would only block the reactor thread.
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_handle_is_not_valid() {
        let h = OwnedHandle::invalid();
        assert!(!h.is_valid());
        assert_eq!(h.raw(), SENTINEL);
    }

    #[test]
    fn new_handle_is_valid() {
        let fds = make_pipe();
        let h = OwnedHandle::new(fds.0);
        assert!(h.is_valid());
        assert_eq!(h.raw(), fds.0);
        unsafe {
            libc::close(fds.1);
        }
    }

    #[test]
    fn close_is_idempotent_and_invalidates() {
        let fds = make_pipe();
        let mut h = OwnedHandle::new(fds.0);
        h.close();
        assert!(!h.is_valid());
        h.close(); // must not double-close or panic
        unsafe {
            libc::close(fds.1);
        }
    }

    #[test]
    fn take_leaves_sentinel_behind() {
        let fds = make_pipe();
        let mut h = OwnedHandle::new(fds.0);
        let taken = h.take();
        assert_eq!(taken, fds.0);
        assert!(!h.is_valid());
        unsafe {
            libc::close(taken);
            libc::close(fds.1);
        }
    }

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }
}

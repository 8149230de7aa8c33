use std::cell::RefCell;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, warn};

use crate::audit::AuditLogger;
use crate::config::Config;
use crate::error::Result;
use crate::net::{self, Event, Interest, OwnedHandle, Readiness, Reactor};
use crate::session::{Outcome, Session};

const MAX_EVENTS: usize = 256;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Installs a `SIGINT` handler that only flips an atomic flag, observed by the reactor
/// loop between `wait()` calls. No unwinding or allocation happens inside the handler.
pub fn install_shutdown_handler() -> Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_sigint as usize;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) < 0 {
            return Err(crate::error::Error::from(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Owns the listen socket, the reactor, the audit logger and the two-key fd-to-Session
/// registration table, and drives the single-threaded accept/dispatch/retire loop.
pub struct Server {
    listen_fd: OwnedHandle,
    reactor: Reactor,
    audit: AuditLogger,
    db_host: Ipv4Addr,
    db_port: u16,
    sessions: HashMap<RawFd, Rc<RefCell<Session>>>,
}

impl Server {
    pub fn new(config: &Config) -> Result<Self> {
        let listen_fd = net::listen(config.listen_port)?;
        let reactor = Reactor::new()?;
        reactor.register(listen_fd.raw(), Interest::READ)?;
        let audit = AuditLogger::new(&config.log_path, config.db_host.to_string(), config.db_port)?;
        Ok(Server {
            listen_fd,
            reactor,
            audit,
            db_host: config.db_host,
            db_port: config.db_port,
            sessions: HashMap::new(),
        })
    }

    /// Runs the reactor loop until `SIGINT` is observed.
    pub fn run(&mut self) -> Result<()> {
        while !SHUTDOWN.load(Ordering::Relaxed) {
            self.step()?;
        }
        info!("shutting down");
        Ok(())
    }

    /// Blocks for one batch of readiness events and dispatches all of them. Exposed
    /// separately from `run` so tests can drive a bounded number of iterations instead
    /// of looping until a signal arrives.
    pub fn step(&mut self) -> Result<()> {
        let mut events = [Event {
            fd: -1,
            mask: Readiness::empty(),
        }; MAX_EVENTS];

        let n = match self.reactor.wait(&mut events, MAX_EVENTS) {
            Ok(n) => n,
            Err(e) if e.is_interrupted() => return Ok(()),
            Err(e) => return Err(e),
        };
        for event in &events[..n] {
            if SHUTDOWN.load(Ordering::Relaxed) {
                break;
            }
            if event.fd == self.listen_fd.raw() {
                self.accept_new_connections();
            } else {
                self.dispatch(event.fd, event.mask);
            }
        }
        Ok(())
    }

    /// Drains the accept queue: `net::accept` returning `Ok(None)` is the drain-loop
    /// terminator, so this keeps calling it until no connection is pending.
    fn accept_new_connections(&mut self) {
        loop {
            let (client_fd, client_addr) = match net::accept(self.listen_fd.raw()) {
                Ok(Some(pair)) => pair,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            };

            let upstream_fd = match net::connect(self.db_host, self.db_port) {
                Ok(fd) => fd,
                Err(e) => {
                    error!(error = %e, client = %client_addr, "failed to connect upstream, dropping client");
                    continue;
                }
            };

            let client_raw = client_fd.raw();
            let upstream_raw = upstream_fd.raw();
            if let Err(e) = self.reactor.register(client_raw, Interest::READ) {
                warn!(error = %e, "failed to register client fd");
                continue;
            }
            if let Err(e) = self.reactor.register(upstream_raw, Interest::READ) {
                warn!(error = %e, "failed to register upstream fd");
                self.reactor.unregister(client_raw);
                continue;
            }

            let session = Rc::new(RefCell::new(Session::new(client_fd, upstream_fd, client_addr)));
            self.sessions.insert(client_raw, session.clone());
            self.sessions.insert(upstream_raw, session);
            self.audit.connection_opened(client_addr);
        }
    }

    /// Looks up the Session owning `fd` and runs its per-event algorithm. A miss (the
    /// session was already retired by a prior event in this same batch) is ignored.
    fn dispatch(&mut self, fd: RawFd, mask: Readiness) {
        let Some(session) = self.sessions.get(&fd).cloned() else {
            return;
        };
        let outcome = session.borrow_mut().handle_event(&self.reactor, &mut self.audit, fd, mask);
        if outcome == Outcome::Retire {
            self.retire(&session);
        }
    }

    /// Removes both fds from the reactor and the registration table and closes both
    /// descriptors by dropping the session's `OwnedHandle`s.
    fn retire(&mut self, session: &Rc<RefCell<Session>>) {
        let session_ref = session.borrow();
        let client_fd = session_ref.client_fd();
        let upstream_fd = session_ref.upstream_fd();
        let client_addr = session_ref.client_endpoint();
        drop(session_ref);

        self.reactor.unregister(client_fd);
        self.reactor.unregister(upstream_fd);
        self.sessions.remove(&client_fd);
        self.sessions.remove(&upstream_fd);
        self.audit.connection_closed(client_addr);
        debug!(client = %client_addr, "session retired");
        // Dropping `session` here (the caller's last reference, once its own map entries
        // are gone) runs Drop on both OwnedHandles and closes the descriptors.
    }
}

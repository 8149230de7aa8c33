use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::audit::AuditLogger;
use crate::error::Error;
use crate::net::{self, Interest, OwnedHandle, Readiness, Reactor};
use crate::proto;

/// `{ip, port}` of the remote peer of a client socket, captured at accept time.
pub type Endpoint = SocketAddrV4;

const RECV_CHUNK: usize = 16 * 1024;

/// Coarse lifecycle state, derived from a Session's fields for introspection and testing.
/// Not stored directly: the actual forwarding behavior is gated by `ssl_decline_sent` alone,
/// matching the per-event algorithm in full.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SessionState {
    New,
    AwaitingSslDecision,
    SslDeclined,
    Proxying,
    Retired,
}

enum RecvOutcome {
    Ok,
    PeerClosed,
    Fatal(Error),
}

enum SendOutcome {
    Flushed,
    WouldBlock,
    Fatal(Error),
}

/// What the reactor loop should do with a Session after dispatching one event to it.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Outcome {
    Continue,
    Retire,
}

/// The bidirectional byte pipe pairing one accepted client socket with one upstream socket.
pub struct Session {
    client_fd: OwnedHandle,
    upstream_fd: OwnedHandle,
    /// Bytes received from upstream, awaiting write to the client.
    client_egress: BytesMut,
    /// Bytes received from the client, awaiting write to upstream.
    upstream_egress: BytesMut,
    ssl_decline_sent: bool,
    client_endpoint: Endpoint,
    retired: bool,
    ever_received_client_bytes: bool,
    ever_forwarded_client_bytes: bool,
}

impl Session {
    pub fn new(client_fd: OwnedHandle, upstream_fd: OwnedHandle, client_endpoint: Endpoint) -> Self {
        Session {
            client_fd,
            upstream_fd,
            client_egress: BytesMut::new(),
            upstream_egress: BytesMut::new(),
            ssl_decline_sent: false,
            client_endpoint,
            retired: false,
            ever_received_client_bytes: false,
            ever_forwarded_client_bytes: false,
        }
    }

    pub fn client_fd(&self) -> RawFd {
        self.client_fd.raw()
    }

    pub fn upstream_fd(&self) -> RawFd {
        self.upstream_fd.raw()
    }

    pub fn client_endpoint(&self) -> Endpoint {
        self.client_endpoint
    }

    pub fn peer_of(&self, fd: RawFd) -> RawFd {
        if fd == self.client_fd() {
            self.upstream_fd()
        } else {
            self.client_fd()
        }
    }

    pub fn state(&self) -> SessionState {
        if self.retired {
            SessionState::Retired
        } else if self.ssl_decline_sent && !self.ever_forwarded_client_bytes {
            SessionState::SslDeclined
        } else if self.ever_forwarded_client_bytes {
            SessionState::Proxying
        } else if self.ever_received_client_bytes {
            SessionState::AwaitingSslDecision
        } else {
            SessionState::New
        }
    }

    fn is_client(&self, fd: RawFd) -> bool {
        fd == self.client_fd()
    }

    /// Egress buffer that bytes newly read FROM `fd` are appended to (the opposite direction).
    fn incoming_egress(&mut self, fd: RawFd) -> &mut BytesMut {
        if self.is_client(fd) {
            &mut self.upstream_egress
        } else {
            &mut self.client_egress
        }
    }

    /// Egress buffer holding bytes destined TO `fd`.
    fn outgoing_egress(&mut self, fd: RawFd) -> &mut BytesMut {
        if self.is_client(fd) {
            &mut self.client_egress
        } else {
            &mut self.upstream_egress
        }
    }

    /// Reads from `fd` until would-block, appending into the opposite direction's egress buffer.
    fn recv_from(&mut self, fd: RawFd) -> RecvOutcome {
        let mut buf = [0u8; RECV_CHUNK];
        loop {
            match net::recv(fd, &mut buf) {
                Ok(Some(n)) => {
                    if self.is_client(fd) {
                        self.ever_received_client_bytes = true;
                    }
                    self.incoming_egress(fd).extend_from_slice(&buf[..n]);
                }
                Ok(None) => return RecvOutcome::PeerClosed,
                Err(e) if e.is_would_block() => return RecvOutcome::Ok,
                Err(e) if e.is_interrupted() => continue,
                Err(e) => return RecvOutcome::Fatal(e),
            }
        }
    }

    /// Drains the egress buffer owned BY `fd`, writing until empty or would-block.
    fn try_send(&mut self, fd: RawFd) -> SendOutcome {
        loop {
            let buf = self.outgoing_egress(fd);
            if buf.is_empty() {
                return SendOutcome::Flushed;
            }
            match net::send(fd, buf) {
                Ok(n) => {
                    let _ = buf.split_to(n);
                }
                Err(e) if e.is_would_block() => return SendOutcome::WouldBlock,
                Err(e) if e.is_interrupted() => continue,
                Err(e) => return SendOutcome::Fatal(e),
            }
        }
    }

    /// Recomputes `fd`'s kernel interest from its outgoing egress buffer and applies it.
    /// This is the single routine every egress mutation must funnel through, so the
    /// "WRITE in mask iff buffer non-empty" invariant can never be violated.
    fn update_interest(&mut self, reactor: &Reactor, fd: RawFd) {
        let mut interest = Interest::READ;
        if !self.outgoing_egress(fd).is_empty() {
            interest |= Interest::WRITE;
        }
        if let Err(e) = reactor.modify(fd, interest) {
            warn!(fd, error = %e, "failed to update epoll interest");
        }
    }

    /// If `fd` is the client, not yet past the SSL decision, and the bytes that were just
    /// appended to `upstream_egress` are exactly an `SSLRequest`, replies `'N'` and discards
    /// those 8 bytes so they are never forwarded upstream. Returns true if it did so.
    fn maybe_decline_ssl(&mut self, fd: RawFd) -> bool {
        if !self.is_client(fd) || self.ssl_decline_sent {
            return false;
        }
        if !proto::is_ssl_request(&self.upstream_egress) {
            return false;
        }
        match net::send(self.client_fd(), &[proto::SSL_DECLINE_REPLY]) {
            Ok(_) => {
                self.upstream_egress.clear();
                self.ssl_decline_sent = true;
                debug!(client = %self.client_endpoint, "declined SSL negotiation");
                true
            }
            Err(e) => {
                warn!(client = %self.client_endpoint, error = %e, "failed to send SSL decline");
                false
            }
        }
    }

    /// Logs any Query message in the bytes just received from the client, before they are
    /// forwarded upstream. Per the spec this conservatively re-classifies the whole
    /// just-received slice rather than tracking frame boundaries across chunks.
    fn log_client_query(&mut self, fd: RawFd, audit: &mut AuditLogger, just_received: &[u8]) {
        if !self.is_client(fd) {
            return;
        }
        audit.save(self.client_endpoint, just_received);
    }

    /// Runs the per-event algorithm from the component spec for one readiness event
    /// `(fd, mask)` delivered by the reactor loop. Returns whether the session should
    /// continue or be retired.
    pub fn handle_event(
        &mut self,
        reactor: &Reactor,
        audit: &mut AuditLogger,
        fd: RawFd,
        mask: Readiness,
    ) -> Outcome {
        if mask.contains(Readiness::WRITE) {
            match self.try_send(fd) {
                SendOutcome::Fatal(e) => {
                    warn!(fd, error = %e, "fatal error writing to socket");
                    return Outcome::Retire;
                }
                SendOutcome::Flushed | SendOutcome::WouldBlock => {}
            }
            if !mask.contains(Readiness::READ) {
                self.update_interest(reactor, self.client_fd());
                self.update_interest(reactor, self.upstream_fd());
                return Outcome::Continue;
            }
        }

        let before_len = self.incoming_egress_len(fd);
        match self.recv_from(fd) {
            RecvOutcome::PeerClosed | RecvOutcome::Fatal(_) => return Outcome::Retire,
            RecvOutcome::Ok => {}
        }
        let just_received_len = self.incoming_egress_len(fd) - before_len;

        if self.is_client(fd) {
            if self.maybe_decline_ssl(fd) {
                // The 8 SSLRequest bytes were discarded, never forwarded. Nothing else to do
                // for this event: no query to log, nothing new to push to the peer.
                self.update_interest(reactor, self.client_fd());
                self.update_interest(reactor, self.upstream_fd());
                return Outcome::Continue;
            }

            if just_received_len > 0 {
                let total = self.upstream_egress.len();
                let just_received = self.upstream_egress[total - just_received_len..].to_vec();
                self.log_client_query(fd, audit, &just_received);
                self.ever_forwarded_client_bytes = true;
            }
        }

        let peer = self.peer_of(fd);
        match self.try_send(peer) {
            SendOutcome::Fatal(e) => {
                warn!(fd = peer, error = %e, "fatal error writing to peer socket");
                return Outcome::Retire;
            }
            SendOutcome::Flushed | SendOutcome::WouldBlock => {}
        }

        self.update_interest(reactor, self.client_fd());
        self.update_interest(reactor, self.upstream_fd());
        Outcome::Continue
    }

    fn incoming_egress_len(&mut self, fd: RawFd) -> usize {
        self.incoming_egress(fd).len()
    }
}

//! End-to-end scenarios driven over real loopback TCP socket pairs, standing in for the
//! PostgreSQL client and backend so the proxy never sees anything but ordinary sockets.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;

use pgproxy::config::Config;
use pgproxy::server::Server;

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

struct Harness {
    server: Server,
    client: TcpStream,
    backend: TcpStream,
    log_path: std::path::PathBuf,
    _tempdir: tempfile::TempDir,
}

fn harness() -> Harness {
    let fake_backend = TcpListener::bind("127.0.0.1:0").unwrap();
    let backend_port = fake_backend.local_addr().unwrap().port();
    let proxy_port = free_port();

    let tempdir = tempfile::tempdir().unwrap();
    let log_path = tempdir.path().join("audit.log");
    let config = Config::from_args(
        [
            proxy_port.to_string(),
            "127.0.0.1".to_string(),
            backend_port.to_string(),
            log_path.to_str().unwrap().to_string(),
        ]
        .into_iter(),
    )
    .unwrap();
    let mut server = Server::new(&config).unwrap();

    let client = TcpStream::connect(("127.0.0.1", proxy_port)).unwrap();
    server.step().unwrap(); // accept + upstream connect
    let (backend, _) = fake_backend.accept().unwrap();

    Harness {
        server,
        client,
        backend,
        log_path,
        _tempdir: tempdir,
    }
}

fn read_available(stream: &mut TcpStream) -> Vec<u8> {
    stream.set_nonblocking(true).unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    for _ in 0..200 {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                out.extend_from_slice(&buf[..n]);
                if n < buf.len() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if out.is_empty() {
                    std::thread::yield_now();
                    continue;
                }
                break;
            }
            Err(e) => panic!("unexpected read error: {}", e),
        }
    }
    out
}

fn audit_contents(h: &Harness) -> String {
    let mut s = String::new();
    std::fs::File::open(&h.log_path).unwrap().read_to_string(&mut s).unwrap();
    s
}

#[test]
fn s1_ssl_decline() {
    let mut h = harness();
    h.client.write_all(&[0x00, 0x00, 0x00, 0x08, 0x04, 0xD2, 0x16, 0x2F]).unwrap();
    h.server.step().unwrap();

    let reply = read_available(&mut h.client);
    assert_eq!(reply, vec![b'N']);

    let upstream_bytes = read_available(&mut h.backend);
    assert!(upstream_bytes.is_empty());
    assert!(audit_contents(&h).is_empty());
}

#[test]
fn s2_simple_query_logged_and_forwarded() {
    let mut h = harness();
    h.client.write_all(&[0x00, 0x00, 0x00, 0x08, 0x04, 0xD2, 0x16, 0x2F]).unwrap();
    h.server.step().unwrap();
    let _ = read_available(&mut h.client);

    let query: &[u8] = &[
        0x51, 0x00, 0x00, 0x00, 0x0E, b'S', b'E', b'L', b'E', b'C', b'T', b' ', b'1', b';', 0x00,
    ];
    h.client.write_all(query).unwrap();
    h.server.step().unwrap();

    let forwarded = read_available(&mut h.backend);
    assert_eq!(forwarded, query);
    assert!(audit_contents(&h).trim_end().ends_with("SELECT 1;"));
}

#[test]
fn s3_non_query_bytes_forwarded_but_not_logged() {
    let mut h = harness();
    let parse_msg: &[u8] = &[0x50, 0x00, 0x00, 0x00, 0x05, 0x00];
    h.client.write_all(parse_msg).unwrap();
    h.server.step().unwrap();

    let forwarded = read_available(&mut h.backend);
    assert_eq!(forwarded, parse_msg);
    assert!(audit_contents(&h).is_empty());
}

#[test]
fn s4_upstream_to_client_passthrough() {
    let mut h = harness();
    let auth_ok: &[u8] = &[0x52, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00];
    h.backend.write_all(auth_ok).unwrap();
    h.server.step().unwrap();

    let received = read_available(&mut h.client);
    assert_eq!(received, auth_ok);
    assert!(audit_contents(&h).is_empty());
}

#[test]
fn s6_client_close_retires_session_and_closes_upstream() {
    let mut h = harness();
    drop(h.client);
    h.server.step().unwrap();

    h.backend.set_nonblocking(true).unwrap();
    let mut buf = [0u8; 1];
    // The upstream side must have been closed by the proxy: either EOF (Ok(0)) or a reset.
    match h.backend.read(&mut buf) {
        Ok(0) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            std::thread::sleep(std::time::Duration::from_millis(50));
            match h.backend.read(&mut buf) {
                Ok(0) => {}
                other => panic!("expected upstream EOF after client close, got {:?}", other),
            }
        }
        other => panic!("expected upstream EOF after client close, got {:?}", other),
    }
}

#[test]
fn s5_backpressure_buffers_then_drains() {
    let mut h = harness();

    // Shrink the backend's receive window so a flood from the client can't be forwarded
    // to it in a single send(): the remainder has to sit in the proxy's egress buffer
    // with WRITE interest registered on the upstream fd until the backend drains it.
    unsafe {
        let bufsize: libc::c_int = 1024;
        libc::setsockopt(
            h.backend.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &bufsize as *const _ as *const libc::c_void,
            std::mem::size_of_val(&bufsize) as libc::socklen_t,
        );
    }

    let payload = vec![0x42u8; 65536];
    h.client.write_all(&payload).unwrap();
    h.server.step().unwrap(); // client READ event: read all 64KiB, forward as much as fits

    h.backend.set_nonblocking(true).unwrap();
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    drain_available(&mut h.backend, &mut buf, &mut received);
    assert!(
        received.len() < payload.len(),
        "expected the shrunk receive window to hold some bytes back, got all {} bytes in one step",
        received.len()
    );

    // Each drain frees window on the backend socket, which must cause the buffered
    // remainder to resume flowing the next time the reactor loop observes WRITE-ready.
    for _ in 0..500 {
        if received.len() >= payload.len() {
            break;
        }
        h.server.step().unwrap();
        drain_available(&mut h.backend, &mut buf, &mut received);
    }

    assert_eq!(received.len(), payload.len(), "buffered remainder never fully drained");
    assert!(received.iter().all(|&b| b == 0x42));
}

fn drain_available(stream: &mut TcpStream, buf: &mut [u8], out: &mut Vec<u8>) {
    loop {
        match stream.read(buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => panic!("unexpected read error: {}", e),
        }
    }
}

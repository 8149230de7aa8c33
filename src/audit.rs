use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddrV4;

use chrono::Local;
use tracing::{debug, info};

use crate::error::Result;
use crate::proto;

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Appends SQL audit lines to a file and connection status lines to stdout. Both sinks are
/// best-effort: a short write is not retried, matching the spec's "ordered, append-only,
/// not transactional" contract.
pub struct AuditLogger {
    log_file: File,
    db_host: String,
    db_port: u16,
}

impl AuditLogger {
    /// Opens `log_path` in append mode, creating it if absent. Failure here is fatal and
    /// propagates to the caller, which is expected to abort startup.
    pub fn new(log_path: &str, db_host: String, db_port: u16) -> Result<Self> {
        let log_file = OpenOptions::new().create(true).append(true).open(log_path)?;
        Ok(AuditLogger {
            log_file,
            db_host,
            db_port,
        })
    }

    /// If `raw_client_buffer` is a Simple Query frame, appends one SQL log line. Any other
    /// buffer is silently ignored.
    pub fn save(&mut self, client: SocketAddrV4, raw_client_buffer: &[u8]) {
        let Some(sql) = proto::extract_sql_text(raw_client_buffer) else {
            return;
        };
        let line = format!("[{}] [client: {}] {}\n", timestamp(), client, sql);
        if let Err(e) = self.log_file.write_all(line.as_bytes()) {
            debug!(error = %e, "failed to write sql log line");
            return;
        }
        let _ = self.log_file.flush();
    }

    pub fn connection_opened(&self, client: SocketAddrV4) {
        println!(
            "[{}] Connection open: client {} -> pgsql server {}:{}",
            timestamp(),
            client,
            self.db_host,
            self.db_port
        );
        info!(%client, db_host = %self.db_host, db_port = self.db_port, "connection open");
    }

    pub fn connection_closed(&self, client: SocketAddrV4) {
        println!(
            "[{}] Connection closed: client {} -> pgsql server {}:{}",
            timestamp(),
            client,
            self.db_host,
            self.db_port
        );
        info!(%client, db_host = %self.db_host, db_port = self.db_port, "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::Ipv4Addr;

    fn client() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 54321)
    }

    fn query_frame(sql: &str) -> Vec<u8> {
        let mut payload = sql.as_bytes().to_vec();
        payload.push(0);
        let len = (payload.len() + 4) as u32;
        let mut buf = vec![0x51];
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&payload);
        buf
    }

    #[test]
    fn logs_query_frames_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let mut logger = AuditLogger::new(path.to_str().unwrap(), "127.0.0.1".into(), 5432).unwrap();

        let query: &[u8] = &[
            0x51, 0x00, 0x00, 0x00, 0x0E, b'S', b'E', b'L', b'E', b'C', b'T', b' ', b'1', b';', 0x00,
        ];
        logger.save(client(), query);
        logger.save(client(), &[0x50, 0x00, 0x00, 0x00, 0x05, 0x00]);

        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("SELECT 1;"));
        assert!(lines[0].contains("[client: 127.0.0.1:54321]"));
    }

    #[test]
    fn appends_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");

        {
            let mut logger = AuditLogger::new(path.to_str().unwrap(), "127.0.0.1".into(), 5432).unwrap();
            logger.save(client(), &query_frame("select 1"));
        }
        {
            let mut logger = AuditLogger::new(path.to_str().unwrap(), "127.0.0.1".into(), 5432).unwrap();
            logger.save(client(), &query_frame("select 2"));
        }

        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}

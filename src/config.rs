use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Validated startup configuration, built once from the four mandatory positional
/// arguments named in the CLI contract: `<listen_port> <db_host> <db_port> <log_file>`.
pub struct Config {
    pub listen_port: u16,
    pub db_host: Ipv4Addr,
    pub db_port: u16,
    pub log_path: String,
}

impl Config {
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<Self> {
        let args: Vec<String> = args.into_iter().collect();
        if args.len() != 4 {
            return Err(Error::new(
                "usage: <program> <listen_port> <db_host> <db_port> <log_file>",
            ));
        }
        let listen_port = parse_port(&args[0])?;
        let db_host: Ipv4Addr = args[1]
            .parse()
            .map_err(|_| Error::new(format!("db_host {:?} is not a dotted-quad IPv4 address", args[1])))?;
        let db_port = parse_port(&args[2])?;
        let log_path = args[3].clone();

        Ok(Config {
            listen_port,
            db_host,
            db_port,
            log_path,
        })
    }
}

fn parse_port(s: &str) -> Result<u16> {
    let port: u32 = s.parse().map_err(|_| Error::new(format!("{:?} is not a valid port", s)))?;
    if port == 0 || port > 65535 {
        return Err(Error::new(format!("port {} out of range [1, 65535]", port)));
    }
    Ok(port as u16)
}

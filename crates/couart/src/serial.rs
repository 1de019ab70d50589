//! The serial provider: opens (and caches) one [`Connection`] per
//! device.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use log::{debug, info};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};

use crate::connection::Connection;
use crate::error::Error;

/// Opens or reuses connections for request hosts.
///
/// `connect` answers a cached open connection for the host when one
/// exists; connections close themselves once their last interaction
/// ends, after which the next request opens the device anew.
pub trait Connecter: Send + Sync {
    fn connect(&self, host: &str) -> Result<Connection, Error>;
}

/// [`Connecter`] for real serial ports via tokio-serial.
pub struct SerialConnecter {
    baud_rate: u32,
    data_bits: DataBits,
    parity: Parity,
    stop_bits: StopBits,
    connections: Mutex<HashMap<String, Connection>>,
}

impl SerialConnecter {
    /// 8N1 at 115200, the line settings constrained devices usually run.
    pub fn new() -> SerialConnecter {
        SerialConnecter {
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn baud_rate(mut self, baud_rate: u32) -> SerialConnecter {
        self.baud_rate = baud_rate;
        self
    }

    pub fn parity(mut self, parity: Parity) -> SerialConnecter {
        self.parity = parity;
        self
    }

    pub fn stop_bits(mut self, stop_bits: StopBits) -> SerialConnecter {
        self.stop_bits = stop_bits;
        self
    }

    pub fn data_bits(mut self, data_bits: DataBits) -> SerialConnecter {
        self.data_bits = data_bits;
        self
    }

    fn open(&self, path: &str) -> Result<Connection, Error> {
        info!("opening serial port {path} at {} baud", self.baud_rate);
        let port = tokio_serial::new(path, self.baud_rate)
            .data_bits(self.data_bits)
            .parity(self.parity)
            .stop_bits(self.stop_bits)
            .open_native_async()
            .map_err(|err| Error::Serial(format!("failed to open {path}: {err}")))?;
        let (reader, writer) = tokio::io::split(port);
        Ok(Connection::spawn(
            path.to_string(),
            Box::new(reader),
            Box::new(writer),
        ))
    }
}

impl Default for SerialConnecter {
    fn default() -> SerialConnecter {
        SerialConnecter::new()
    }
}

impl Connecter for SerialConnecter {
    fn connect(&self, host: &str) -> Result<Connection, Error> {
        let path = resolve_host(host)?;
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(conn) = connections.get(&path) {
            if !conn.is_closed() {
                debug!("reusing open connection to {path}");
                return Ok(conn.clone());
            }
        }
        let conn = self.open(&path)?;
        connections.insert(path, conn.clone());
        Ok(conn)
    }
}

/// Maps a request host to a device path. `any` takes the first port the
/// platform reports; a bare POSIX device name gets `/dev/` prepended
/// since hosts cannot contain a slash.
fn resolve_host(host: &str) -> Result<String, Error> {
    if host == "any" {
        let ports = tokio_serial::available_ports()
            .map_err(|err| Error::Serial(format!("failed to enumerate ports: {err}")))?;
        return ports
            .into_iter()
            .next()
            .map(|p| p.port_name)
            .ok_or_else(|| Error::Serial("no serial port available".to_string()));
    }
    #[cfg(unix)]
    {
        if !host.starts_with("/dev/") {
            return Ok(format!("/dev/{host}"));
        }
    }
    Ok(host.to_string())
}

use std::env;
use std::net::SocketAddrV4;
use tracing::Level;

pub const DEFAULT_MULTICAST_ADDRESS: &str = "239.12.255.254:9522";
pub const DEFAULT_DBUS_NAME: &str = "com.victronenergy.grid.cgwacs_ttyUSB0_di30_mb1";

/// Process configuration, read once from the environment at startup
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub multicast_address: SocketAddrV4,
    pub dbus_name: String,
    /// Only accept frames from this meter serial. `None` accepts any meter.
    pub serial_filter: Option<u32>,
    pub log_level: Level,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multicast_address: default_multicast_address(),
            dbus_name: DEFAULT_DBUS_NAME.to_string(),
            serial_filter: None,
            log_level: Level::INFO,
        }
    }
}

/// Reads `LOG_LEVEL` alone, so logging can be set up before the rest of the
/// configuration is parsed and its warnings have somewhere to go
pub fn log_level_from_env() -> Level {
    parse_log_level(env::var("LOG_LEVEL").ok())
}

impl Config {
    /// Reads `LOG_LEVEL`, `SMASUSYID`, `MULTICAST_ADDRESS` and `DBUS_NAME`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let multicast_address = match lookup("MULTICAST_ADDRESS") {
            Some(address) if !address.is_empty() => address.parse().unwrap_or_else(|e| {
                tracing::warn!("Ignoring MULTICAST_ADDRESS `{address}`: {e}");
                default_multicast_address()
            }),
            _ => default_multicast_address(),
        };
        let dbus_name = lookup("DBUS_NAME")
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_DBUS_NAME.to_string());

        Self {
            multicast_address,
            dbus_name,
            serial_filter: parse_serial_filter(lookup("SMASUSYID")),
            log_level: parse_log_level(lookup("LOG_LEVEL")),
        }
    }
}

fn default_multicast_address() -> SocketAddrV4 {
    SocketAddrV4::new([239, 12, 255, 254].into(), 9522)
}

/// Missing level means info, an unknown one means debug
fn parse_log_level(val: Option<String>) -> Level {
    match val {
        None => Level::INFO,
        Some(level) => level.trim().parse().unwrap_or(Level::DEBUG),
    }
}

/// Zero, empty and garbage all mean "no filter"
fn parse_serial_filter(val: Option<String>) -> Option<u32> {
    let raw = val?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<u32>() {
        Ok(0) => None,
        Ok(serial) => Some(serial),
        Err(e) => {
            tracing::warn!("Ignoring SMASUSYID `{raw}`: {e}");
            None
        }
    }
}

use serde_derive::Deserialize;
use sloggers::LoggerConfig;
use txpc::crc::CRC32_POLYNOMIAL;

/// Top level bridge configuration, deserialized from TOML.
///
/// ```toml
/// [logging]
/// type = "terminal"
/// level = "info"
/// destination = "stderr"
///
/// [connection]
/// crc_bits = 16
///
/// [[endpoint]]
/// name = "uplink"
/// connect = "10.0.0.7:9000"
///
/// [[endpoint]]
/// name = "console"
/// listen = "127.0.0.1:9001"
///
/// [[route]]
/// from = "uplink"
/// from_channel = 1
/// to = "console"
/// to_channel = 1
/// ```
#[derive(Debug, Deserialize)]
pub struct BridgeConfig {
    pub logging: LoggerConfig,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(rename = "endpoint")]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(rename = "route", default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default)]
    pub big_endian: bool,
    #[serde(default)]
    pub crc_bits: u8,
    #[serde(default = "default_crc_polynomial")]
    pub crc_polynomial: u32,
}

impl Default for ConnectionSettings {
    fn default() -> ConnectionSettings {
        ConnectionSettings {
            big_endian: false,
            crc_bits: 0,
            crc_polynomial: CRC32_POLYNOMIAL,
        }
    }
}

fn default_crc_polynomial() -> u32 {
    CRC32_POLYNOMIAL
}

/// One byte stream endpoint. Exactly one of `listen` and `connect` must be
/// given: `listen` binds and waits for a single inbound connection,
/// `connect` dials out.
#[derive(Debug, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub listen: Option<String>,
    pub connect: Option<String>,
}

impl EndpointConfig {
    pub fn validate(&self) {
        match (&self.listen, &self.connect) {
            (Some(_), Some(_)) | (None, None) => panic!(
                "Endpoint '{}' must set exactly one of listen/connect",
                self.name
            ),
            _ => (),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RouteConfig {
    pub from: String,
    pub from_channel: u8,
    pub to: String,
    pub to_channel: u8,
}

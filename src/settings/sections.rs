//! Typed configuration sections
//!
//! Each section has a compact little-endian encoding, compile-time defaults
//! and range validation. Strings are encoded as `u8 len | bytes`.

use heapless::{String, Vec};

use crate::config::settings::MAX_SECTION_BYTES;
use crate::protocol::SectionId;

use super::SettingsError;

pub type SectionBytes = Vec<u8, MAX_SECTION_BYTES>;

/// Battery chemistries understood by the BMS side
pub mod chemistry {
    pub const NCA: u8 = 0;
    pub const NMC: u8 = 1;
    pub const LFP: u8 = 2;
    pub const LTO: u8 = 3;
}

/// A configuration section with a typed view
pub trait Section: Sized + Default {
    const ID: SectionId;

    fn encode(&self) -> Result<SectionBytes, SettingsError>;

    fn decode(bytes: &[u8]) -> Result<Self, SettingsError>;

    fn validate(&self) -> Result<(), SettingsError>;
}

fn invalid(field: &'static str) -> SettingsError {
    SettingsError::InvalidSetting { field }
}

struct Writer {
    out: SectionBytes,
}

impl Writer {
    fn new() -> Self {
        Self { out: Vec::new() }
    }

    fn bytes(&mut self, b: &[u8]) -> Result<(), SettingsError> {
        self.out.extend_from_slice(b).map_err(|_| invalid("length"))
    }

    fn u8(&mut self, v: u8) -> Result<(), SettingsError> {
        self.bytes(&[v])
    }

    fn u16(&mut self, v: u16) -> Result<(), SettingsError> {
        self.bytes(&v.to_le_bytes())
    }

    fn u32(&mut self, v: u32) -> Result<(), SettingsError> {
        self.bytes(&v.to_le_bytes())
    }

    fn str(&mut self, s: &str) -> Result<(), SettingsError> {
        self.u8(s.len() as u8)?;
        self.bytes(s.as_bytes())
    }

    fn finish(self) -> SectionBytes {
        self.out
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], SettingsError> {
        if self.pos + n > self.buf.len() {
            return Err(invalid(field));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, SettingsError> {
        Ok(self.take(1, field)?[0])
    }

    fn bool(&mut self, field: &'static str) -> Result<bool, SettingsError> {
        match self.u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(invalid(field)),
        }
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, SettingsError> {
        let b = self.take(2, field)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, SettingsError> {
        let b = self.take(4, field)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn ipv4(&mut self, field: &'static str) -> Result<[u8; 4], SettingsError> {
        let b = self.take(4, field)?;
        Ok([b[0], b[1], b[2], b[3]])
    }

    fn str<const N: usize>(&mut self, field: &'static str) -> Result<String<N>, SettingsError> {
        let len = self.u8(field)? as usize;
        let raw = self.take(len, field)?;
        let text = core::str::from_utf8(raw).map_err(|_| invalid(field))?;
        let mut out = String::new();
        out.push_str(text).map_err(|_| invalid(field))?;
        Ok(out)
    }

    fn finish(&self) -> Result<(), SettingsError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(invalid("length"))
        }
    }
}

fn text<const N: usize>(s: &str) -> String<N> {
    let mut out = String::new();
    let pushed = out.push_str(s);
    debug_assert!(pushed.is_ok(), "text longer than its field");
    out
}

/// IP configuration of the Transmitter's uplink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub use_static_ip: bool,
    pub ip: [u8; 4],
    pub gateway: [u8; 4],
    pub subnet: [u8; 4],
    pub dns_primary: [u8; 4],
    pub dns_secondary: [u8; 4],
    pub hostname: String<32>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            use_static_ip: false,
            ip: [0; 4],
            gateway: [0; 4],
            subnet: [255, 255, 255, 0],
            dns_primary: [0; 4],
            dns_secondary: [0; 4],
            hostname: text("espnow-tx"),
        }
    }
}

fn is_contiguous_mask(mask: [u8; 4]) -> bool {
    let m = u32::from_be_bytes(mask);
    m != 0 && m.leading_ones() + m.trailing_zeros() == 32
}

impl Section for NetworkSettings {
    const ID: SectionId = SectionId::Network;

    fn encode(&self) -> Result<SectionBytes, SettingsError> {
        let mut w = Writer::new();
        w.u8(self.use_static_ip as u8)?;
        w.bytes(&self.ip)?;
        w.bytes(&self.gateway)?;
        w.bytes(&self.subnet)?;
        w.bytes(&self.dns_primary)?;
        w.bytes(&self.dns_secondary)?;
        w.str(&self.hostname)?;
        Ok(w.finish())
    }

    fn decode(bytes: &[u8]) -> Result<Self, SettingsError> {
        let mut r = Reader::new(bytes);
        let out = Self {
            use_static_ip: r.bool("use_static_ip")?,
            ip: r.ipv4("ip")?,
            gateway: r.ipv4("gateway")?,
            subnet: r.ipv4("subnet")?,
            dns_primary: r.ipv4("dns_primary")?,
            dns_secondary: r.ipv4("dns_secondary")?,
            hostname: r.str("hostname")?,
        };
        r.finish()?;
        Ok(out)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.hostname.is_empty()
            || !self
                .hostname
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err(invalid("hostname"));
        }
        if self.use_static_ip {
            if self.ip == [0; 4] {
                return Err(invalid("ip"));
            }
            if !is_contiguous_mask(self.subnet) {
                return Err(invalid("subnet"));
            }
            let mask = u32::from_be_bytes(self.subnet);
            let ip = u32::from_be_bytes(self.ip);
            let gw = u32::from_be_bytes(self.gateway);
            if gw != 0 && (ip & mask) != (gw & mask) {
                return Err(invalid("gateway"));
            }
        }
        Ok(())
    }
}

/// MQTT broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub enabled: bool,
    pub host: String<64>,
    pub port: u16,
    pub username: String<32>,
    pub password: String<64>,
    pub client_id: String<32>,
    pub topic_prefix: String<64>,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_id: text("espnow_transmitter"),
            topic_prefix: text("espnow/transmitter"),
        }
    }
}

impl Section for MqttSettings {
    const ID: SectionId = SectionId::Mqtt;

    fn encode(&self) -> Result<SectionBytes, SettingsError> {
        let mut w = Writer::new();
        w.u8(self.enabled as u8)?;
        w.str(&self.host)?;
        w.u16(self.port)?;
        w.str(&self.username)?;
        w.str(&self.password)?;
        w.str(&self.client_id)?;
        w.str(&self.topic_prefix)?;
        Ok(w.finish())
    }

    fn decode(bytes: &[u8]) -> Result<Self, SettingsError> {
        let mut r = Reader::new(bytes);
        let out = Self {
            enabled: r.bool("enabled")?,
            host: r.str("host")?,
            port: r.u16("port")?,
            username: r.str("username")?,
            password: r.str("password")?,
            client_id: r.str("client_id")?,
            topic_prefix: r.str("topic_prefix")?,
        };
        r.finish()?;
        Ok(out)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.enabled {
            if self.host.is_empty() {
                return Err(invalid("host"));
            }
            if self.port == 0 {
                return Err(invalid("port"));
            }
        }
        if self.client_id.is_empty() {
            return Err(invalid("client_id"));
        }
        if self.topic_prefix.contains('#') || self.topic_prefix.contains('+') {
            return Err(invalid("topic_prefix"));
        }
        Ok(())
    }
}

/// Battery pack limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatterySettings {
    pub capacity_wh: u32,
    pub max_voltage_mv: u32,
    pub min_voltage_mv: u32,
    /// Tenths of an amp
    pub max_charge_current_da: u16,
    /// Tenths of an amp
    pub max_discharge_current_da: u16,
    pub soc_high_pct: u8,
    pub soc_low_pct: u8,
    pub cell_count: u8,
    pub chemistry: u8,
    pub double_battery: bool,
}

impl Default for BatterySettings {
    fn default() -> Self {
        Self {
            capacity_wh: 30_000,
            max_voltage_mv: 58_000,
            min_voltage_mv: 46_000,
            max_charge_current_da: 1000,
            max_discharge_current_da: 1000,
            soc_high_pct: 95,
            soc_low_pct: 20,
            cell_count: 16,
            chemistry: chemistry::LFP,
            double_battery: false,
        }
    }
}

impl Section for BatterySettings {
    const ID: SectionId = SectionId::Battery;

    fn encode(&self) -> Result<SectionBytes, SettingsError> {
        let mut w = Writer::new();
        w.u32(self.capacity_wh)?;
        w.u32(self.max_voltage_mv)?;
        w.u32(self.min_voltage_mv)?;
        w.u16(self.max_charge_current_da)?;
        w.u16(self.max_discharge_current_da)?;
        w.u8(self.soc_high_pct)?;
        w.u8(self.soc_low_pct)?;
        w.u8(self.cell_count)?;
        w.u8(self.chemistry)?;
        w.u8(self.double_battery as u8)?;
        Ok(w.finish())
    }

    fn decode(bytes: &[u8]) -> Result<Self, SettingsError> {
        let mut r = Reader::new(bytes);
        let out = Self {
            capacity_wh: r.u32("capacity_wh")?,
            max_voltage_mv: r.u32("max_voltage_mv")?,
            min_voltage_mv: r.u32("min_voltage_mv")?,
            max_charge_current_da: r.u16("max_charge_current")?,
            max_discharge_current_da: r.u16("max_discharge_current")?,
            soc_high_pct: r.u8("soc_high")?,
            soc_low_pct: r.u8("soc_low")?,
            cell_count: r.u8("cell_count")?,
            chemistry: r.u8("chemistry")?,
            double_battery: r.bool("double_battery")?,
        };
        r.finish()?;
        Ok(out)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if !(1_000..=1_000_000).contains(&self.capacity_wh) {
            return Err(invalid("capacity_wh"));
        }
        if !(30_000..=100_000).contains(&self.max_voltage_mv) {
            return Err(invalid("max_voltage_mv"));
        }
        if !(20_000..=80_000).contains(&self.min_voltage_mv) {
            return Err(invalid("min_voltage_mv"));
        }
        if self.min_voltage_mv >= self.max_voltage_mv {
            return Err(invalid("min_voltage_mv"));
        }
        if self.max_charge_current_da > 5000 {
            return Err(invalid("max_charge_current"));
        }
        if self.max_discharge_current_da > 5000 {
            return Err(invalid("max_discharge_current"));
        }
        if !(50..=100).contains(&self.soc_high_pct) {
            return Err(invalid("soc_high"));
        }
        if self.soc_low_pct > 50 || self.soc_low_pct >= self.soc_high_pct {
            return Err(invalid("soc_low"));
        }
        if !(4..=32).contains(&self.cell_count) {
            return Err(invalid("cell_count"));
        }
        if self.chemistry > chemistry::LTO {
            return Err(invalid("chemistry"));
        }
        Ok(())
    }
}

fn check<T: Section>(bytes: &[u8]) -> Result<(), SettingsError> {
    T::decode(bytes)?.validate()
}

/// Decode and range-check raw bytes for `section`
pub fn validate_bytes(section: SectionId, bytes: &[u8]) -> Result<(), SettingsError> {
    match section {
        SectionId::Network => check::<NetworkSettings>(bytes),
        SectionId::Mqtt => check::<MqttSettings>(bytes),
        SectionId::Battery => check::<BatterySettings>(bytes),
    }
}

/// Encoded compile-time defaults for `section`
pub fn default_bytes(section: SectionId) -> SectionBytes {
    let encoded = match section {
        SectionId::Network => NetworkSettings::default().encode(),
        SectionId::Mqtt => MqttSettings::default().encode(),
        SectionId::Battery => BatterySettings::default().encode(),
    };
    encoded.unwrap_or_default()
}

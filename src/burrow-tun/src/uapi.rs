//! Device configuration ("UAPI") surface.
//!
//! Implements the cross-platform configuration protocol's get/set
//! operations against an abstract engine ([`DeviceControl`]): the engine
//! owns keys, peers and the UDP bind; this module owns the config model,
//! the apply semantics and the numeric error codes reported to clients.

use std::fmt;
use std::net::SocketAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const IPC_ERROR_INVALID: i64 = 1;
pub const IPC_ERROR_PORT_IN_USE: i64 = 2;

/// Configuration failure carrying the numeric code of the wire protocol.
#[derive(Debug, Error)]
#[error("IPC error {code}: {message}")]
pub struct IpcError {
    pub code: i64,
    message: String,
}

impl IpcError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: IPC_ERROR_INVALID,
            message: message.into(),
        }
    }

    pub fn port_in_use(message: impl Into<String>) -> Self {
        Self {
            code: IPC_ERROR_PORT_IN_USE,
            message: message.into(),
        }
    }
}

/// 32-byte Curve25519 key in its hex transport form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key([u8; 32]);

impl Key {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IpcError> {
        if s.len() != 64 || !s.is_ascii() {
            return Err(IpcError::invalid(format!(
                "key must be 64 hex characters, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, out) in bytes.iter_mut().enumerate() {
            let pair = &s[i * 2..i * 2 + 2];
            *out = u8::from_str_radix(pair, 16)
                .map_err(|_| IpcError::invalid("key contains non-hex characters"))?;
        }
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut s = String::with_capacity(64);
        for b in self.0 {
            s.push(HEX[usize::from(b >> 4)] as char);
            s.push(HEX[usize::from(b & 0xf)] as char);
        }
        s
    }
}

impl TryFrom<String> for Key {
    type Error = IpcError;

    fn try_from(s: String) -> Result<Self, IpcError> {
        Self::from_hex(&s)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> String {
        key.to_hex()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // keys never appear in full in logs
        write!(f, "Key({}…)", &self.to_hex()[..8])
    }
}

/// Full device configuration (the "set" operation).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub private_key: Option<Key>,
    #[serde(default)]
    pub listen_port: Option<u16>,
    #[serde(default)]
    pub fwmark: Option<u32>,
    /// Remove all existing peers before applying the list below.
    #[serde(default)]
    pub replace_peers: bool,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// Per-peer configuration block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub public_key: Key,
    #[serde(default)]
    pub preshared_key: Option<Key>,
    #[serde(default)]
    pub endpoint: Option<SocketAddr>,
    /// Keepalive interval in seconds; 0 disables.
    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
    /// Remove the peer's allowed IPs before adding the list below.
    #[serde(default)]
    pub replace_allowed_ips: bool,
    #[serde(default)]
    pub allowed_ips: Vec<IpNetwork>,
    /// Only apply to peers that already exist.
    #[serde(default)]
    pub update_only: bool,
    /// Delete the peer instead of configuring it.
    #[serde(default)]
    pub remove: bool,
}

impl PeerConfig {
    pub fn new(public_key: Key) -> Self {
        Self {
            public_key,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive: None,
            replace_allowed_ips: false,
            allowed_ips: Vec::new(),
            update_only: false,
            remove: false,
        }
    }
}

/// Read-only device state (the "get" operation).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub private_key: Option<Key>,
    pub public_key: Option<Key>,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
    pub peers: Vec<PeerSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub public_key: Key,
    pub preshared_key: Option<Key>,
    pub endpoint: Option<SocketAddr>,
    /// Nanoseconds since the epoch; `None` before the first handshake.
    pub last_handshake_nanos: Option<u64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub persistent_keepalive: u16,
    pub allowed_ips: Vec<IpNetwork>,
}

/// Engine-side mutation surface the configuration protocol drives.
///
/// All peer operations address peers by public key; operations on an
/// unknown key are no-ops (the apply loop creates peers first).
pub trait DeviceControl {
    fn public_key(&self) -> Option<Key>;
    fn set_private_key(&mut self, key: Key) -> anyhow::Result<()>;
    fn set_listen_port(&mut self, port: u16) -> anyhow::Result<()>;
    fn set_fwmark(&mut self, mark: u32) -> anyhow::Result<()>;

    fn has_peer(&self, key: &Key) -> bool;
    fn create_peer(&mut self, key: &Key) -> anyhow::Result<()>;
    fn remove_peer(&mut self, key: &Key);
    fn remove_all_peers(&mut self);

    fn set_preshared_key(&mut self, peer: &Key, psk: Key);
    fn set_endpoint(&mut self, peer: &Key, endpoint: SocketAddr) -> anyhow::Result<()>;
    /// Returns the previous interval in seconds.
    fn set_persistent_keepalive(&mut self, peer: &Key, secs: u16) -> u16;
    fn clear_allowed_ips(&mut self, peer: &Key);
    fn add_allowed_ip(&mut self, peer: &Key, prefix: IpNetwork) -> anyhow::Result<()>;

    fn is_up(&self) -> bool;
    /// Begin handshakes and flush staged traffic for a (re)configured peer.
    fn start_peer(&mut self, peer: &Key);
    fn send_keepalive(&mut self, peer: &Key);

    fn snapshot(&self) -> DeviceSnapshot;
}

/// Apply a full configuration to the device ("set").
pub fn apply_config<D: DeviceControl>(device: &mut D, config: &DeviceConfig) -> Result<(), IpcError> {
    if let Some(key) = config.private_key {
        debug!("uapi: updating private key");
        device
            .set_private_key(key)
            .map_err(|e| IpcError::invalid(format!("failed to set private key: {e}")))?;
    }

    if let Some(port) = config.listen_port {
        debug!(port, "uapi: updating listen port");
        device
            .set_listen_port(port)
            .map_err(|e| IpcError::port_in_use(format!("failed to set listen port: {e}")))?;
    }

    if let Some(mark) = config.fwmark {
        debug!(mark, "uapi: updating fwmark");
        device
            .set_fwmark(mark)
            .map_err(|e| IpcError::port_in_use(format!("failed to update fwmark: {e}")))?;
    }

    if config.replace_peers {
        debug!("uapi: removing all peers");
        device.remove_all_peers();
    }

    for peer in &config.peers {
        apply_peer(device, peer)?;
    }

    Ok(())
}

/// Apply one peer block. Every mutation completes within this call; no
/// state is held across peers.
fn apply_peer<D: DeviceControl>(device: &mut D, peer: &PeerConfig) -> Result<(), IpcError> {
    if device.public_key().as_ref() == Some(&peer.public_key) {
        // a peer carrying the device's own key is ignored
        return Ok(());
    }

    let existed = device.has_peer(&peer.public_key);
    if !existed && peer.update_only {
        return Ok(());
    }

    if peer.remove {
        if existed {
            debug!(peer = ?peer.public_key, "uapi: removing peer");
            device.remove_peer(&peer.public_key);
        }
        return Ok(());
    }

    if !existed {
        debug!(peer = ?peer.public_key, "uapi: creating peer");
        device
            .create_peer(&peer.public_key)
            .map_err(|e| IpcError::invalid(format!("failed to create new peer: {e}")))?;
    }

    if let Some(psk) = peer.preshared_key {
        device.set_preshared_key(&peer.public_key, psk);
    }

    if let Some(endpoint) = peer.endpoint {
        device
            .set_endpoint(&peer.public_key, endpoint)
            .map_err(|e| IpcError::invalid(format!("failed to set endpoint {endpoint}: {e}")))?;
    }

    let mut keepalive_turned_on = false;
    if let Some(secs) = peer.persistent_keepalive {
        let old = device.set_persistent_keepalive(&peer.public_key, secs);
        keepalive_turned_on = old == 0 && secs != 0;
    }

    if peer.replace_allowed_ips {
        device.clear_allowed_ips(&peer.public_key);
    }

    for prefix in &peer.allowed_ips {
        device
            .add_allowed_ip(&peer.public_key, *prefix)
            .map_err(|e| IpcError::invalid(format!("failed to set allowed ip: {e}")))?;
    }

    if device.is_up() {
        device.start_peer(&peer.public_key);
        if keepalive_turned_on {
            device.send_keepalive(&peer.public_key);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::collections::HashMap;

    #[derive(Debug, Default, Clone)]
    struct MockPeer {
        preshared_key: Option<Key>,
        endpoint: Option<SocketAddr>,
        keepalive: u16,
        allowed_ips: Vec<IpNetwork>,
        started: u32,
        keepalives_sent: u32,
    }

    #[derive(Debug, Default)]
    struct MockDevice {
        private_key: Option<Key>,
        listen_port: Option<u16>,
        fwmark: Option<u32>,
        peers: HashMap<[u8; 32], MockPeer>,
        up: bool,
        port_in_use: Option<u16>,
    }

    impl MockDevice {
        fn peer(&self, key: &Key) -> &MockPeer {
            self.peers.get(key.as_bytes()).expect("peer should exist")
        }
    }

    impl DeviceControl for MockDevice {
        fn public_key(&self) -> Option<Key> {
            // derive a fake public key by inverting the private key bytes
            self.private_key
                .map(|k| Key::from_bytes(k.as_bytes().map(|b| !b)))
        }

        fn set_private_key(&mut self, key: Key) -> anyhow::Result<()> {
            self.private_key = Some(key);
            Ok(())
        }

        fn set_listen_port(&mut self, port: u16) -> anyhow::Result<()> {
            if self.port_in_use == Some(port) {
                bail!("address already in use");
            }
            self.listen_port = Some(port);
            Ok(())
        }

        fn set_fwmark(&mut self, mark: u32) -> anyhow::Result<()> {
            self.fwmark = Some(mark);
            Ok(())
        }

        fn has_peer(&self, key: &Key) -> bool {
            self.peers.contains_key(key.as_bytes())
        }

        fn create_peer(&mut self, key: &Key) -> anyhow::Result<()> {
            self.peers.insert(*key.as_bytes(), MockPeer::default());
            Ok(())
        }

        fn remove_peer(&mut self, key: &Key) {
            self.peers.remove(key.as_bytes());
        }

        fn remove_all_peers(&mut self) {
            self.peers.clear();
        }

        fn set_preshared_key(&mut self, peer: &Key, psk: Key) {
            if let Some(p) = self.peers.get_mut(peer.as_bytes()) {
                p.preshared_key = Some(psk);
            }
        }

        fn set_endpoint(&mut self, peer: &Key, endpoint: SocketAddr) -> anyhow::Result<()> {
            if let Some(p) = self.peers.get_mut(peer.as_bytes()) {
                p.endpoint = Some(endpoint);
            }
            Ok(())
        }

        fn set_persistent_keepalive(&mut self, peer: &Key, secs: u16) -> u16 {
            match self.peers.get_mut(peer.as_bytes()) {
                Some(p) => std::mem::replace(&mut p.keepalive, secs),
                None => 0,
            }
        }

        fn clear_allowed_ips(&mut self, peer: &Key) {
            if let Some(p) = self.peers.get_mut(peer.as_bytes()) {
                p.allowed_ips.clear();
            }
        }

        fn add_allowed_ip(&mut self, peer: &Key, prefix: IpNetwork) -> anyhow::Result<()> {
            if let Some(p) = self.peers.get_mut(peer.as_bytes()) {
                p.allowed_ips.push(prefix);
            }
            Ok(())
        }

        fn is_up(&self) -> bool {
            self.up
        }

        fn start_peer(&mut self, peer: &Key) {
            if let Some(p) = self.peers.get_mut(peer.as_bytes()) {
                p.started += 1;
            }
        }

        fn send_keepalive(&mut self, peer: &Key) {
            if let Some(p) = self.peers.get_mut(peer.as_bytes()) {
                p.keepalives_sent += 1;
            }
        }

        fn snapshot(&self) -> DeviceSnapshot {
            DeviceSnapshot {
                private_key: self.private_key,
                public_key: self.public_key(),
                listen_port: self.listen_port,
                fwmark: self.fwmark,
                peers: self
                    .peers
                    .iter()
                    .map(|(key, p)| PeerSnapshot {
                        public_key: Key::from_bytes(*key),
                        preshared_key: p.preshared_key,
                        endpoint: p.endpoint,
                        last_handshake_nanos: None,
                        rx_bytes: 0,
                        tx_bytes: 0,
                        persistent_keepalive: p.keepalive,
                        allowed_ips: p.allowed_ips.clone(),
                    })
                    .collect(),
            }
        }
    }

    fn key(fill: u8) -> Key {
        Key::from_bytes([fill; 32])
    }

    #[test]
    fn key_hex_roundtrip() {
        let k = key(0xab);
        assert_eq!(k.to_hex(), "ab".repeat(32));
        assert_eq!(Key::from_hex(&k.to_hex()).unwrap(), k);

        assert_eq!(Key::from_hex("ff").unwrap_err().code, IPC_ERROR_INVALID);
        assert_eq!(
            Key::from_hex(&"zz".repeat(32)).unwrap_err().code,
            IPC_ERROR_INVALID
        );
    }

    #[test]
    fn key_debug_is_truncated() {
        let rendered = format!("{:?}", key(0xab));
        assert_eq!(rendered, "Key(abababab…)");
    }

    #[test]
    fn config_serde_uses_hex_keys() {
        let config = DeviceConfig {
            private_key: Some(key(0x01)),
            listen_port: Some(51820),
            peers: vec![PeerConfig::new(key(0x02))],
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(&"01".repeat(32)));
        let parsed: DeviceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.private_key, Some(key(0x01)));
        assert_eq!(parsed.peers[0].public_key, key(0x02));
    }

    #[test]
    fn apply_sets_device_fields_and_creates_peers() {
        let mut device = MockDevice::default();
        let config = DeviceConfig {
            private_key: Some(key(0x01)),
            listen_port: Some(51820),
            fwmark: Some(7),
            replace_peers: false,
            peers: vec![PeerConfig {
                endpoint: Some("192.0.2.1:51820".parse().unwrap()),
                allowed_ips: vec!["10.0.0.0/24".parse().unwrap()],
                ..PeerConfig::new(key(0x02))
            }],
        };

        apply_config(&mut device, &config).unwrap();
        assert_eq!(device.listen_port, Some(51820));
        assert_eq!(device.fwmark, Some(7));
        let peer = device.peer(&key(0x02));
        assert_eq!(peer.endpoint, Some("192.0.2.1:51820".parse().unwrap()));
        assert_eq!(peer.allowed_ips.len(), 1);
    }

    #[test]
    fn port_in_use_reports_code_2() {
        let mut device = MockDevice {
            port_in_use: Some(51820),
            ..Default::default()
        };
        let config = DeviceConfig {
            listen_port: Some(51820),
            ..Default::default()
        };
        let err = apply_config(&mut device, &config).unwrap_err();
        assert_eq!(err.code, IPC_ERROR_PORT_IN_USE);
    }

    #[test]
    fn own_public_key_is_skipped() {
        let mut device = MockDevice::default();
        device.set_private_key(key(0x01)).unwrap();
        let own_public = device.public_key().unwrap();

        let config = DeviceConfig {
            peers: vec![PeerConfig::new(own_public)],
            ..Default::default()
        };
        apply_config(&mut device, &config).unwrap();
        assert!(device.peers.is_empty());
    }

    #[test]
    fn update_only_skips_unknown_peer() {
        let mut device = MockDevice::default();
        let config = DeviceConfig {
            peers: vec![PeerConfig {
                update_only: true,
                ..PeerConfig::new(key(0x02))
            }],
            ..Default::default()
        };
        apply_config(&mut device, &config).unwrap();
        assert!(device.peers.is_empty());
    }

    #[test]
    fn remove_deletes_peer_by_key() {
        let mut device = MockDevice::default();
        device.create_peer(&key(0x02)).unwrap();

        let config = DeviceConfig {
            peers: vec![PeerConfig {
                remove: true,
                ..PeerConfig::new(key(0x02))
            }],
            ..Default::default()
        };
        apply_config(&mut device, &config).unwrap();
        assert!(device.peers.is_empty());
    }

    #[test]
    fn replace_peers_clears_before_applying() {
        let mut device = MockDevice::default();
        device.create_peer(&key(0x02)).unwrap();
        device.create_peer(&key(0x03)).unwrap();

        let config = DeviceConfig {
            replace_peers: true,
            peers: vec![PeerConfig::new(key(0x04))],
            ..Default::default()
        };
        apply_config(&mut device, &config).unwrap();
        assert_eq!(device.peers.len(), 1);
        assert!(device.has_peer(&key(0x04)));
    }

    #[test]
    fn keepalive_turning_on_sends_one_immediately_when_up() {
        let mut device = MockDevice {
            up: true,
            ..Default::default()
        };
        let config = DeviceConfig {
            peers: vec![PeerConfig {
                persistent_keepalive: Some(25),
                ..PeerConfig::new(key(0x02))
            }],
            ..Default::default()
        };
        apply_config(&mut device, &config).unwrap();
        let peer = device.peer(&key(0x02));
        assert_eq!(peer.keepalive, 25);
        assert_eq!(peer.keepalives_sent, 1);
        assert_eq!(peer.started, 1);

        // reapplying the same interval is not a 0 -> on transition
        apply_config(&mut device, &config).unwrap();
        assert_eq!(device.peer(&key(0x02)).keepalives_sent, 1);
    }

    #[test]
    fn keepalive_not_sent_when_device_down() {
        let mut device = MockDevice::default();
        let config = DeviceConfig {
            peers: vec![PeerConfig {
                persistent_keepalive: Some(25),
                ..PeerConfig::new(key(0x02))
            }],
            ..Default::default()
        };
        apply_config(&mut device, &config).unwrap();
        let peer = device.peer(&key(0x02));
        assert_eq!(peer.keepalives_sent, 0);
        assert_eq!(peer.started, 0);
    }

    #[test]
    fn replace_allowed_ips_clears_old_prefixes() {
        let mut device = MockDevice::default();
        device.create_peer(&key(0x02)).unwrap();
        device
            .add_allowed_ip(&key(0x02), "10.0.0.0/24".parse().unwrap())
            .unwrap();

        let config = DeviceConfig {
            peers: vec![PeerConfig {
                replace_allowed_ips: true,
                allowed_ips: vec!["192.0.2.0/28".parse().unwrap()],
                ..PeerConfig::new(key(0x02))
            }],
            ..Default::default()
        };
        apply_config(&mut device, &config).unwrap();
        assert_eq!(
            device.peer(&key(0x02)).allowed_ips,
            vec!["192.0.2.0/28".parse::<IpNetwork>().unwrap()]
        );
    }

    #[test]
    fn snapshot_reflects_applied_config() {
        let mut device = MockDevice::default();
        let config = DeviceConfig {
            private_key: Some(key(0x01)),
            listen_port: Some(51820),
            peers: vec![PeerConfig {
                persistent_keepalive: Some(15),
                ..PeerConfig::new(key(0x02))
            }],
            ..Default::default()
        };
        apply_config(&mut device, &config).unwrap();

        let snapshot = device.snapshot();
        assert_eq!(snapshot.listen_port, Some(51820));
        assert_eq!(snapshot.peers.len(), 1);
        assert_eq!(snapshot.peers[0].persistent_keepalive, 15);
    }
}

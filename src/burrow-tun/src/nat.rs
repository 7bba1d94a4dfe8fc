//! Contract consumed from the user-mode NAT that owns the real sockets.
//!
//! The substrate never opens sockets itself: it submits rewritten packets
//! to a [`UserNat`] and registers a single receive callback for returning
//! traffic. Everything here is the seam to that collaborator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// Opaque addressing the NAT attaches to packets in flight.
///
/// The substrate always submits with the default (unrouted) path and
/// ignores the source path reported with received packets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferPath {
    pub source_id: Option<String>,
    pub destination_id: Option<String>,
}

/// Egress mode requested from the NAT. The substrate only ever uses
/// [`ProvideMode::Network`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvideMode {
    None,
    Network,
    Public,
}

/// IP protocol discriminator the NAT reports alongside received packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    Unknown,
    Tcp,
    Udp,
}

/// Callback invoked by the NAT's dispatcher for every received packet.
pub type ReceiveCallback = Arc<dyn Fn(TransferPath, IpProtocol, Vec<u8>) + Send + Sync>;

/// Deregistration guard returned by [`UserNat::on_receive`].
///
/// Dropping the guard (or calling [`ReceiveRegistration::deregister`])
/// removes the callback; the NAT must not invoke it afterwards.
pub struct ReceiveRegistration(Option<Box<dyn FnOnce() + Send>>);

impl ReceiveRegistration {
    pub fn new(deregister: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(deregister)))
    }

    /// Remove the callback now instead of at drop time.
    pub fn deregister(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for ReceiveRegistration {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl std::fmt::Debug for ReceiveRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ReceiveRegistration")
            .field(&self.0.is_some())
            .finish()
    }
}

/// User-mode NAT owning the real OS sockets.
#[async_trait]
pub trait UserNat: Send + Sync {
    /// Best-effort submission of one egress packet. Returns `false` when
    /// the packet could not be accepted within `timeout`.
    async fn send(
        &self,
        path: TransferPath,
        mode: ProvideMode,
        packet: Bytes,
        timeout: Duration,
    ) -> bool;

    /// Register the receive callback. The returned guard deregisters it.
    fn on_receive(&self, callback: ReceiveCallback) -> ReceiveRegistration;
}

//! # burrow-tun
//!
//! Userspace NAT'd TUN substrate for a WireGuard engine.
//!
//! The engine hands this device cleartext IP datagrams decrypted on behalf
//! of tunneled peers. The substrate rewrites their source to a configured
//! public address, pushes them through a user-mode NAT that owns the real
//! sockets, and reverses the translation on returning packets before the
//! engine reads and re-encrypts them.
//!
//! ```text
//!  engine.write ──▶ rewrite src ──▶ flow insert ──▶ UserNat.send
//!  engine.read  ◀── read queue ◀── rewrite dst ◀── UserNat callback
//! ```

/// The NAT-backed TUN device exposed to the engine
pub mod device;
/// Device lifecycle event flags
pub mod events;
/// NAT flow table (public-side endpoint → tunneled source)
pub mod flow;
/// Contract consumed from the user-mode NAT collaborator
pub mod nat;
/// IP packet parsing and NAT rewriting
pub mod packet;
/// Device configuration ("UAPI") surface
pub mod uapi;

pub use device::{Device, TunError, UserspaceTun};
pub use events::Event;
pub use flow::{FlowKey, FlowTable, FlowValue};
pub use nat::{IpProtocol, ProvideMode, ReceiveRegistration, TransferPath, UserNat};
pub use packet::PublicAddrs;

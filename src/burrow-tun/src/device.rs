//! The NAT-backed userspace TUN device exposed to the WireGuard engine.
//!
//! Three actors touch a device concurrently: the engine's write worker, the
//! NAT's receive dispatcher, and the engine's read worker. The flow table
//! is the only state they share; the write path is additionally serialised
//! so the per-batch scratch is never re-entered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::events::Event;
use crate::flow::FlowTable;
use crate::nat::{IpProtocol, ProvideMode, ReceiveRegistration, TransferPath, UserNat};
use crate::packet::{self, PublicAddrs};

/// Depth of the device event bus.
pub const EVENT_BUS_CAPACITY: usize = 5;
/// Depth of the inbound read queue.
pub const READ_QUEUE_DEPTH: usize = 256;
/// Per-packet deadline handed to [`UserNat::send`].
pub const SEND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TunError {
    /// The device has been closed.
    #[error("device is closed")]
    Closed,
    /// A read-side datagram did not fit the caller's buffer.
    #[error("datagram of {datagram} bytes exceeds read buffer of {buffer} bytes")]
    BufferTooSmall { datagram: usize, buffer: usize },
    /// The NAT refused or timed out on a packet.
    #[error("failed to send packet through NAT")]
    SendFailed,
    /// The packet could not be rewritten.
    #[error(transparent)]
    Rewrite(#[from] packet::RewriteError),
    /// Several per-packet failures from one write batch.
    #[error("{}", join_messages(.0))]
    Batch(Vec<TunError>),
}

fn join_messages(errors: &[TunError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Collapse per-packet errors into none, one, or a joined batch.
fn join_errors(mut errors: Vec<TunError>) -> Option<TunError> {
    match errors.len() {
        0 => None,
        1 => Some(errors.remove(0)),
        _ => Some(TunError::Batch(errors)),
    }
}

/// Device surface the WireGuard engine drives.
#[async_trait]
pub trait Device: Send + Sync {
    /// Receive one inbound datagram into `bufs[0][offset..]`, storing its
    /// length in `sizes[0]`. Returns the number of datagrams delivered.
    async fn read(
        &self,
        bufs: &mut [&mut [u8]],
        sizes: &mut [usize],
        offset: usize,
    ) -> Result<usize, TunError>;

    /// Rewrite and submit a batch of outbound packets; each buffer's IP
    /// header starts at `offset`. Returns the number of packets accepted by
    /// the NAT plus the joined per-packet errors, if any.
    async fn write(&self, bufs: &[&[u8]], offset: usize) -> (usize, Option<TunError>);

    /// Queue a lifecycle event towards the engine; blocks while the bus is
    /// full.
    async fn add_event(&self, event: Event) -> Result<(), TunError>;

    /// Hand out the single event receiver. Subsequent calls return `None`.
    fn events(&self) -> Option<mpsc::Receiver<Event>>;

    /// Always 0 in this substrate; the engine must tolerate it.
    fn mtu(&self) -> usize;

    /// Always 1 in this substrate, regardless of engine capability.
    fn batch_size(&self) -> usize;

    /// Shut the device down. Idempotent.
    fn close(&self);
}

/// State shared with the NAT receive callback.
struct Shared {
    flows: FlowTable,
    public: PublicAddrs,
    read_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl Shared {
    /// Receive-path entry point, called from the NAT's dispatcher. Must not
    /// block: a full read queue drops the packet.
    fn handle_nat_receive(&self, _source: TransferPath, _protocol: IpProtocol, data: Vec<u8>) {
        let rewritten = match packet::rewrite_inbound(&data, &self.flows) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(e) => {
                trace!(%e, "dropping malformed inbound packet");
                return;
            }
        };
        let tx = self.read_tx.lock().expect("read queue lock poisoned").clone();
        let Some(tx) = tx else {
            return; // closed
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(rewritten) {
            warn!("read queue full, dropping inbound packet");
        }
    }
}

/// Userspace TUN device backed by a [`UserNat`].
///
/// Created with fixed public addresses; outbound packets of a family with
/// no configured address fail. See [`UserspaceTun::new`].
pub struct UserspaceTun {
    shared: Arc<Shared>,
    nat: Arc<dyn UserNat>,
    /// Serialises write batches and guards the batch index scratch.
    write_op: tokio::sync::Mutex<Vec<usize>>,
    read_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    events_tx: Mutex<Option<mpsc::Sender<Event>>>,
    events_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    nat_registration: Mutex<Option<ReceiveRegistration>>,
    closed: AtomicBool,
}

impl UserspaceTun {
    /// Create a device NATing outbound traffic to `public`, registering its
    /// receive callback on `nat`.
    pub fn new(nat: Arc<dyn UserNat>, public: PublicAddrs) -> Arc<Self> {
        Self::with_flow_table(nat, public, FlowTable::new())
    }

    /// As [`UserspaceTun::new`] with a caller-configured flow table (e.g.
    /// one with an idle TTL).
    pub fn with_flow_table(
        nat: Arc<dyn UserNat>,
        public: PublicAddrs,
        flows: FlowTable,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUS_CAPACITY);
        let (read_tx, read_rx) = mpsc::channel(READ_QUEUE_DEPTH);

        let shared = Arc::new(Shared {
            flows,
            public,
            read_tx: Mutex::new(Some(read_tx)),
        });

        let cb_shared = Arc::clone(&shared);
        let registration = nat.on_receive(Arc::new(move |source, protocol, data| {
            cb_shared.handle_nat_receive(source, protocol, data);
        }));

        Arc::new(Self {
            shared,
            nat,
            write_op: tokio::sync::Mutex::new(Vec::new()),
            read_rx: tokio::sync::Mutex::new(read_rx),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
            nat_registration: Mutex::new(Some(registration)),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of live NAT flows, for diagnostics.
    pub fn flow_count(&self) -> usize {
        self.shared.flows.len()
    }

    async fn write_one(&self, data: &[u8]) -> Result<usize, TunError> {
        let Some(rewrite) = packet::rewrite_outbound(data, &self.shared.public)? else {
            return Ok(0); // no transport layer: discard as success
        };
        let sent = self
            .nat
            .send(
                TransferPath::default(),
                ProvideMode::Network,
                Bytes::from(rewrite.bytes),
                SEND_TIMEOUT,
            )
            .await;
        if !sent {
            return Err(TunError::SendFailed);
        }
        // record the flow only once the NAT accepted the packet
        self.shared.flows.insert(rewrite.key, rewrite.value);
        Ok(1)
    }
}

#[async_trait]
impl Device for UserspaceTun {
    async fn read(
        &self,
        bufs: &mut [&mut [u8]],
        sizes: &mut [usize],
        offset: usize,
    ) -> Result<usize, TunError> {
        let datagram = {
            let mut rx = self.read_rx.lock().await;
            rx.recv().await
        }
        .ok_or(TunError::Closed)?;

        let target = &mut bufs[0][offset..];
        if datagram.len() > target.len() {
            return Err(TunError::BufferTooSmall {
                datagram: datagram.len(),
                buffer: target.len(),
            });
        }
        target[..datagram.len()].copy_from_slice(&datagram);
        sizes[0] = datagram.len();
        Ok(1)
    }

    async fn write(&self, bufs: &[&[u8]], offset: usize) -> (usize, Option<TunError>) {
        if self.closed.load(Ordering::Acquire) {
            return (0, Some(TunError::Closed));
        }
        let mut scratch = self.write_op.lock().await;
        scratch.clear();
        scratch.extend(0..bufs.len());

        let mut total = 0;
        let mut errors = Vec::new();
        for &i in scratch.iter() {
            match self.write_one(&bufs[i][offset..]).await {
                Ok(n) => total += n,
                Err(e) => errors.push(e),
            }
        }
        (total, join_errors(errors))
    }

    async fn add_event(&self, event: Event) -> Result<(), TunError> {
        let tx = self
            .events_tx
            .lock()
            .expect("event bus lock poisoned")
            .clone();
        match tx {
            Some(tx) => tx.send(event).await.map_err(|_| TunError::Closed),
            None => Err(TunError::Closed),
        }
    }

    fn events(&self) -> Option<mpsc::Receiver<Event>> {
        self.events_rx
            .lock()
            .expect("event bus lock poisoned")
            .take()
    }

    fn mtu(&self) -> usize {
        0
    }

    fn batch_size(&self) -> usize {
        1
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing userspace TUN device");
        // dropping the senders closes both channels; readers drain then
        // observe closure
        self.events_tx.lock().expect("event bus lock poisoned").take();
        self.shared
            .read_tx
            .lock()
            .expect("read queue lock poisoned")
            .take();
        if let Some(registration) = self
            .nat_registration
            .lock()
            .expect("registration lock poisoned")
            .take()
        {
            registration.deregister();
        }
        self.shared.flows.clear();
    }
}

impl Drop for UserspaceTun {
    fn drop(&mut self) {
        self.close();
    }
}

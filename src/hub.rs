use crate::HUB_QUEUE_CAPACITY;
use axum::extract::ws::Message;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outbound buffer per connection; a consumer that falls this far behind is
/// evicted, gorilla-style, so one slow reader cannot stall the hub
const CONNECTION_BUFFER: usize = 32;

enum Control {
    Register { id: u64, tx: mpsc::Sender<Message> },
    Unregister { id: u64 },
    Shutdown,
}

/// Handle to one site's hub, cheap to clone into request handlers and the
/// script runtime
#[derive(Clone)]
pub struct HubHandle {
    site_id: String,
    control_tx: mpsc::UnboundedSender<Control>,
    broadcast_tx: mpsc::Sender<String>,
    client_count: Arc<AtomicUsize>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    /// Attach a new connection. Returns the connection id and the receiver
    /// the caller forwards into its WebSocket sink.
    pub fn register(&self) -> (u64, mpsc::Receiver<Message>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
        let _ = self.control_tx.send(Control::Register { id, tx });
        (id, rx)
    }

    /// Detach a connection (client went away or its writer failed)
    pub fn unregister(&self, id: u64) {
        let _ = self.control_tx.send(Control::Unregister { id });
    }

    /// Enqueue a text frame for every live connection. Never blocks: when
    /// the hub queue is full the message is dropped and logged.
    pub fn broadcast(&self, message: String) {
        match self.broadcast_tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Hub '{}' broadcast queue full; dropping message",
                    self.site_id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Hub '{}' already shut down; dropping message", self.site_id);
            }
        }
    }

    /// Current number of live connections
    pub fn clients(&self) -> usize {
        self.client_count.load(Ordering::Relaxed)
    }

    fn shutdown(&self) {
        let _ = self.control_tx.send(Control::Shutdown);
    }
}

/// Process-lifetime registry of per-site hubs.
///
/// Hubs are created lazily on first reference and removed when their site is
/// deleted, taking their lifecycle task and connections with them.
pub struct HubRegistry {
    hubs: Mutex<HashMap<String, HubHandle>>,
}

impl Default for HubRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HubRegistry {
    pub fn new() -> Self {
        HubRegistry {
            hubs: Mutex::new(HashMap::new()),
        }
    }

    /// Hub for a site, created on first use
    pub fn handle(&self, site_id: &str) -> HubHandle {
        let mut hubs = self.hubs.lock();
        if let Some(handle) = hubs.get(site_id) {
            return handle.clone();
        }

        let handle = spawn_hub(site_id.to_string());
        hubs.insert(site_id.to_string(), handle.clone());
        handle
    }

    /// Stop and drop a site's hub, closing all its connections
    pub fn remove_site(&self, site_id: &str) {
        if let Some(handle) = self.hubs.lock().remove(site_id) {
            handle.shutdown();
            info!("Hub for site '{}' shut down", site_id);
        }
    }

    /// Stop every hub (process shutdown)
    pub fn shutdown_all(&self) {
        let mut hubs = self.hubs.lock();
        for (site_id, handle) in hubs.drain() {
            handle.shutdown();
            debug!("Hub for site '{}' shut down", site_id);
        }
    }
}

fn spawn_hub(site_id: String) -> HubHandle {
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let (broadcast_tx, mut broadcast_rx) = mpsc::channel::<String>(HUB_QUEUE_CAPACITY);
    let client_count = Arc::new(AtomicUsize::new(0));

    let count = client_count.clone();
    let task_site = site_id.clone();
    tokio::spawn(async move {
        // Registration order is preserved so broadcasts reach connections in
        // the order they attached
        let mut connections: Vec<(u64, mpsc::Sender<Message>)> = Vec::new();

        loop {
            tokio::select! {
                control = control_rx.recv() => match control {
                    Some(Control::Register { id, tx }) => {
                        connections.push((id, tx));
                        count.store(connections.len(), Ordering::Relaxed);
                        debug!("Hub '{}': connection {} registered", task_site, id);
                    }
                    Some(Control::Unregister { id }) => {
                        connections.retain(|(conn_id, _)| *conn_id != id);
                        count.store(connections.len(), Ordering::Relaxed);
                        debug!("Hub '{}': connection {} unregistered", task_site, id);
                    }
                    Some(Control::Shutdown) | None => break,
                },
                Some(message) = broadcast_rx.recv() => {
                    let mut evicted = Vec::new();
                    for (id, tx) in &connections {
                        if tx.try_send(Message::Text(message.clone())).is_err() {
                            evicted.push(*id);
                        }
                    }
                    if !evicted.is_empty() {
                        warn!(
                            "Hub '{}': evicting {} unresponsive connection(s)",
                            task_site,
                            evicted.len()
                        );
                        connections.retain(|(id, _)| !evicted.contains(id));
                    }
                    count.store(connections.len(), Ordering::Relaxed);
                }
            }
        }

        // Dropping the senders closes every connection's forward loop
        connections.clear();
        count.store(0, Ordering::Relaxed);
        debug!("Hub '{}' task exited", task_site);
    });

    HubHandle {
        site_id,
        control_tx,
        broadcast_tx,
        client_count,
        next_id: Arc::new(AtomicU64::new(1)),
    }
}

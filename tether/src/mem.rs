use std::{io, sync::Arc};

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{
    mutex::Mutex,
    transport::{Address, Connecting, Connector, Io},
};

/// In-process network of named listeners
///
/// Clones refer to the same network.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<FxHashMap<Address, mpsc::UnboundedSender<Io>>>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on `address`
    ///
    /// Fails with [`io::ErrorKind::AddrInUse`] if a live listener already holds the address.
    pub fn bind(&self, address: Address) -> io::Result<Listener> {
        let mut listeners = self.listeners.lock("bind");
        if let Some(existing) = listeners.get(&address) {
            if !existing.is_closed() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{address} is already bound"),
                ));
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(address.clone(), tx);
        debug!(%address, "listening");
        Ok(Listener {
            address,
            incoming: rx,
            network: self.clone(),
        })
    }

    /// Establish a link to the listener bound at `address`
    pub fn connect(&self, address: &Address) -> io::Result<Io> {
        let listeners = self.listeners.lock("connect");
        let refused = || {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("nothing listening on {address}"),
            )
        };
        let listener = listeners.get(address).ok_or_else(refused)?;
        let (local, remote) = Io::pair();
        listener.send(remote).map_err(|_| refused())?;
        trace!(%address, "connected");
        Ok(local)
    }
}

impl Connector for MemoryNetwork {
    fn connect(&self, address: &Address) -> Connecting {
        let result = Self::connect(self, address);
        Box::pin(async move { result })
    }
}

/// Accepts links made to one address of a [`MemoryNetwork`]
///
/// Dropping the listener frees the address.
#[derive(Debug)]
pub struct Listener {
    address: Address,
    incoming: mpsc::UnboundedReceiver<Io>,
    network: MemoryNetwork,
}

impl Listener {
    /// Wait for the next incoming link
    pub async fn accept(&mut self) -> Option<Io> {
        self.incoming.recv().await
    }

    /// Address this listener is bound to
    pub fn address(&self) -> &Address {
        &self.address
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.incoming.close();
        let mut listeners = self.network.listeners.lock("unbind");
        // A closed sender under our address can only be ours
        if listeners.get(&self.address).map_or(false, |x| x.is_closed()) {
            listeners.remove(&self.address);
        }
    }
}

use std::{fmt, future::Future, io, pin::Pin, sync::Arc};

use proto::Frame;
use tokio::sync::mpsc;

/// Name of a peer a connection can be established to
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Address(Arc<str>);

impl Address {
    /// The address as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Address {
    fn from(x: &str) -> Self {
        Self(x.into())
    }
}

impl From<String> for Address {
    fn from(x: String) -> Self {
        Self(x.into())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// One end of an established, ordered frame link
///
/// Frames sent on one end arrive at the other in order. Dropping an end closes the link; the
/// other end then receives `None`.
#[derive(Debug)]
pub struct Io {
    pub(crate) tx: mpsc::UnboundedSender<Frame>,
    pub(crate) rx: mpsc::UnboundedReceiver<Frame>,
}

impl Io {
    /// Create two connected ends
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self { tx: a_tx, rx: b_rx }, Self { tx: b_tx, rx: a_rx })
    }
}

/// Future returned by [`Connector::connect`]
pub type Connecting = Pin<Box<dyn Future<Output = io::Result<Io>> + Send>>;

/// Establishes links to addresses
///
/// Implementations own everything below frames: sockets, encoding, security. Connections
/// built on the returned [`Io`] are driven by this crate.
pub trait Connector: Send + Sync + fmt::Debug + 'static {
    /// Begin establishing a link to `address`
    fn connect(&self, address: &Address) -> Connecting;
}

use std::sync::Arc;

use tokio::sync::watch;

use crate::transport::Address;

/// Source of the addresses a channel's target currently resolves to
///
/// Channels read the latest list whenever they pick a connection for a new call, so updates
/// redirect new calls without disturbing calls already in flight.
#[derive(Debug, Clone)]
pub struct Resolver(watch::Receiver<Arc<[Address]>>);

impl Resolver {
    /// A resolver whose list never changes
    pub fn fixed<I>(addresses: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Address>,
    {
        let (tx, rx) = watch::channel(collect(addresses));
        // Dropping the sender freezes the value
        drop(tx);
        Self(rx)
    }

    /// A resolver updated through the returned [`ManualResolver`]
    pub fn manual() -> (Self, ManualResolver) {
        let (tx, rx) = watch::channel(collect(Vec::<Address>::new()));
        (Self(rx), ManualResolver(tx))
    }

    /// Latest address list
    pub fn addresses(&self) -> Arc<[Address]> {
        self.0.borrow().clone()
    }
}

/// Publishes address lists to a [`Resolver`]
#[derive(Debug)]
pub struct ManualResolver(watch::Sender<Arc<[Address]>>);

impl ManualResolver {
    /// Replace the address list
    pub fn set_addresses<I>(&self, addresses: I)
    where
        I: IntoIterator,
        I::Item: Into<Address>,
    {
        self.0.send_replace(collect(addresses));
    }
}

fn collect<I>(addresses: I) -> Arc<[Address]>
where
    I: IntoIterator,
    I::Item: Into<Address>,
{
    addresses.into_iter().map(Into::into).collect()
}

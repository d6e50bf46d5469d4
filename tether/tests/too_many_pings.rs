use std::{
    io::{self, Write},
    str,
    sync::Arc,
    time::Duration,
};

use tether::{
    Channel, ChannelArgs, ClientStack, Code, CompletionQueue, MemoryNetwork, PropagationMask,
    Resolver, Server, Stack, Status, SubchannelPool, Tag,
};
use tokio::time::Instant;
use tracing::info_span;
use tracing_futures::Instrument as _;
use tracing_subscriber::EnvFilter;

const SEC: Duration = Duration::from_secs(1);
const METHOD: &str = "/keepalive.Test/Hold";

/// A server that allows one early ping and tolerates pings no closer than 5s
fn strict_server_args() -> ChannelArgs {
    let mut args = ChannelArgs::default();
    args.min_recv_ping_interval_without_data(5 * SEC)
        .max_ping_strikes(1);
    args
}

/// A client that pings every second and is otherwise unrestricted
fn eager_client_args() -> ChannelArgs {
    let mut args = ChannelArgs::default();
    args.keepalive_time(Some(SEC))
        .max_pings_without_data(0)
        .min_sent_ping_interval_without_data(Duration::ZERO);
    args
}

fn channel(
    network: &MemoryNetwork,
    target: &str,
    args: ChannelArgs,
    pool: &Arc<SubchannelPool>,
) -> Channel {
    let stack = ClientStack::new(Resolver::fixed([target]), network.clone()).pool(pool.clone());
    Channel::create(target, args, Stack::Client(stack)).unwrap()
}

/// Run a call the server never answers, until the connection carrying it is lost
async fn hold_call(channel: &Channel, server: &Server, cq: &CompletionQueue, tag: Tag) -> Status {
    let mut call = channel.create_call(None, PropagationMask::DEFAULTS, cq, METHOD, None, None);
    call.start(tag).unwrap();
    // Keep the stream open on the server so the connection stays active
    let _held = server.request_call().await.unwrap();
    let event = cq.next().await.unwrap();
    assert_eq!(event.tag, tag);
    assert!(event.success);
    event.status.unwrap()
}

fn assert_too_many_pings(status: &Status) {
    assert_eq!(status.code, Code::Unavailable, "{status}");
    assert!(status.message.contains("too_many_pings"), "{status}");
}

#[tokio::test(start_paused = true)]
async fn keepalive_backs_off_until_accepted() -> anyhow::Result<()> {
    let _guard = subscribe();
    let network = MemoryNetwork::new();
    let server = Server::bind(&network, "mem:strict", strict_server_args())?;
    let channel = channel(
        &network,
        "mem:strict",
        eager_client_args(),
        &SubchannelPool::new(),
    );
    let cq = CompletionQueue::new();
    let start = Instant::now();

    for (i, expected) in [2, 4, 8].into_iter().enumerate() {
        let status = hold_call(&channel, &server, &cq, Tag(i as u64))
            .instrument(info_span!("round", i))
            .await;
        assert_too_many_pings(&status);
        assert_eq!(channel.keepalive_interval(), Some(expected * SEC));
    }
    // Each connection is sent away on its third ping
    assert_eq!(start.elapsed(), (3 + 6 + 12) * SEC);

    let snapshot = channel.channelz_node().snapshot();
    assert_eq!(snapshot.keepalive_throttle_events, 3);
    assert!(snapshot
        .trace
        .iter()
        .any(|x| x.description.contains("raised to 8s")));

    // Pinging every 8s satisfies the server; the call runs into its own deadline instead
    let deadline = Instant::now() + 15 * SEC;
    let mut call = channel.create_call(
        None,
        PropagationMask::DEFAULTS,
        &cq,
        METHOD,
        None,
        Some(deadline),
    );
    call.start(Tag(10))?;
    let held = server.request_call().await.unwrap();
    let event = cq.next().await.unwrap();
    assert_eq!(event.status, Some(Status::deadline_exceeded()));
    assert_eq!(channel.keepalive_interval(), Some(8 * SEC));
    held.cancelled().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn channels_sharing_a_connection_back_off_together() -> anyhow::Result<()> {
    let _guard = subscribe();
    let network = MemoryNetwork::new();
    let server = Server::bind(&network, "mem:shared", strict_server_args())?;
    let pool = SubchannelPool::new();
    let first = channel(&network, "mem:shared", eager_client_args(), &pool);
    let second = channel(&network, "mem:shared", eager_client_args(), &pool);
    let cq = CompletionQueue::new();

    let mut a = first.create_call(None, PropagationMask::DEFAULTS, &cq, METHOD, None, None);
    a.start(Tag(1))?;
    let _held_a = server.request_call().await.unwrap();
    let mut b = second.create_call(None, PropagationMask::DEFAULTS, &cq, METHOD, None, None);
    b.start(Tag(2))?;
    let _held_b = server.request_call().await.unwrap();
    assert_eq!(server.connections(), 1);

    for _ in 0..2 {
        assert_too_many_pings(&cq.next().await.unwrap().status.unwrap());
    }
    // One connection reported once, and both channels see the result
    assert_eq!(first.keepalive_interval(), Some(2 * SEC));
    assert_eq!(second.keepalive_interval(), Some(2 * SEC));
    assert_eq!(
        first.channelz_node().snapshot().keepalive_throttle_events,
        1
    );
    assert_eq!(
        second.channelz_node().snapshot().keepalive_throttle_events,
        0
    );

    // Different arguments or a different pool mean independent throttling
    let mut args = eager_client_args();
    args.bdp_probe(false);
    let other_args = channel(&network, "mem:shared", args, &pool);
    assert_eq!(other_args.keepalive_interval(), Some(SEC));
    let other_pool = channel(
        &network,
        "mem:shared",
        eager_client_args(),
        &SubchannelPool::new(),
    );
    assert_eq!(other_pool.keepalive_interval(), Some(SEC));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn targets_resolving_alike_throttle_separately() -> anyhow::Result<()> {
    let _guard = subscribe();
    let network = MemoryNetwork::new();
    let server = Server::bind(&network, "mem:alias", strict_server_args())?;
    let pool = SubchannelPool::new();
    let alias = |target: &str| {
        let stack = ClientStack::new(Resolver::fixed(["mem:alias"]), network.clone())
            .pool(pool.clone());
        Channel::create(target, eager_client_args(), Stack::Client(stack)).unwrap()
    };
    let x = alias("dns:x");
    let y = alias("dns:y");
    let cq = CompletionQueue::new();

    let mut a = x.create_call(None, PropagationMask::DEFAULTS, &cq, METHOD, None, None);
    a.start(Tag(1))?;
    let _held_a = server.request_call().await.unwrap();
    let mut b = y.create_call(None, PropagationMask::DEFAULTS, &cq, METHOD, None, None);
    b.start(Tag(2))?;
    let _held_b = server.request_call().await.unwrap();
    // Each target keeps its own connection, built with its own throttle
    assert_eq!(server.connections(), 2);

    for _ in 0..2 {
        assert_too_many_pings(&cq.next().await.unwrap().status.unwrap());
    }
    assert_eq!(x.keepalive_interval(), Some(2 * SEC));
    assert_eq!(x.keepalive_interval(), y.keepalive_interval());
    for channel in [&x, &y] {
        assert_eq!(
            channel.channelz_node().snapshot().keepalive_throttle_events,
            1
        );
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn throttle_spans_subchannels() -> anyhow::Result<()> {
    let _guard = subscribe();
    let network = MemoryNetwork::new();
    let a = Server::bind(&network, "mem:a", strict_server_args())?;
    let b = Server::bind(&network, "mem:b", strict_server_args())?;
    let (resolver, updates) = Resolver::manual();
    let stack = ClientStack::new(resolver, network.clone()).pool(SubchannelPool::new());
    let channel = Channel::create("dns:strict", eager_client_args(), Stack::Client(stack))?;
    let cq = CompletionQueue::new();

    for (i, (server, address, expected)) in [(&a, "mem:a", 2), (&b, "mem:b", 4), (&a, "mem:a", 8)]
        .into_iter()
        .enumerate()
    {
        updates.set_addresses([address]);
        let status = hold_call(&channel, server, &cq, Tag(i as u64))
            .instrument(info_span!("round", address))
            .await;
        assert_too_many_pings(&status);
        assert_eq!(channel.keepalive_interval(), Some(expected * SEC));
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn interval_stops_at_ceiling() -> anyhow::Result<()> {
    let _guard = subscribe();
    let network = MemoryNetwork::new();
    let server = Server::bind(&network, "mem:capped", strict_server_args())?;
    let mut args = eager_client_args();
    args.keepalive_time_ceiling(2 * SEC);
    let channel = channel(&network, "mem:capped", args, &SubchannelPool::new());
    let cq = CompletionQueue::new();

    for i in 0..3 {
        assert_too_many_pings(&hold_call(&channel, &server, &cq, Tag(i)).await);
        assert_eq!(channel.keepalive_interval(), Some(2 * SEC));
    }
    assert_eq!(
        channel.channelz_node().snapshot().keepalive_throttle_events,
        1
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_keepalive_fails_calls() -> anyhow::Result<()> {
    let _guard = subscribe();
    let network = MemoryNetwork::new();
    let mut listener = network.bind("mem:silent".into())?;
    let mut args = eager_client_args();
    args.keepalive_timeout(2 * SEC);
    let channel = channel(&network, "mem:silent", args, &SubchannelPool::new());
    let cq = CompletionQueue::new();
    let start = Instant::now();

    let mut call = channel.create_call(None, PropagationMask::DEFAULTS, &cq, METHOD, None, None);
    call.start(Tag(1))?;
    // Accept the link but never read from it
    let _peer = listener.accept().await.unwrap();
    let status = cq.next().await.unwrap().status.unwrap();
    assert_eq!(status.code, Code::Unavailable);
    assert!(status.message.contains("keepalive"), "{status}");
    assert_eq!(start.elapsed(), 3 * SEC);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn bandwidth_probes_never_strike() -> anyhow::Result<()> {
    const CALLS: u64 = 2000;

    let _guard = subscribe();
    let network = MemoryNetwork::new();
    let server = Server::bind(&network, "mem:bdp", ChannelArgs::default())?;
    let handler = tokio::spawn(
        async move {
            let mut served = 0;
            while let Some(call) = server.request_call().await {
                call.cancel_with_status(Status::cancelled("rejected by handler"));
                served += 1;
                if served == CALLS {
                    break;
                }
            }
            served
        }
        .instrument(info_span!("handler")),
    );

    let channel = channel(
        &network,
        "mem:bdp",
        ChannelArgs::default(),
        &SubchannelPool::new(),
    );
    let cq = CompletionQueue::new();
    for i in 0..CALLS {
        let mut call =
            channel.create_call(None, PropagationMask::DEFAULTS, &cq, METHOD, None, None);
        call.start(Tag(i))?;
        let status = cq.next().await.unwrap().status.unwrap();
        assert_eq!(status.code, Code::Cancelled, "call {i}: {status}");
    }
    assert_eq!(handler.await?, CALLS);
    assert_eq!(channel.channelz_node().snapshot().calls_failed, CALLS);
    Ok(())
}

fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

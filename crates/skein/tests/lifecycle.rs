//! Listen-once, close-once and counted shutdown, over real loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use skein::{Channel, ChannelError, ChannelEvent, ChannelOptions, SubChannelOptions};
use skein_testkit::{init_tracing, MockConnectionFactory, RecordingPeerPool, RecordingReporter};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

async fn next_connection(events: &mut broadcast::Receiver<ChannelEvent>) -> u64 {
    loop {
        match events.recv().await.unwrap() {
            ChannelEvent::Connection(conn) => return conn.id(),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn listen_publishes_host_port_down_the_hierarchy() {
    init_tracing();
    let top = Channel::new(ChannelOptions::default());
    let before = top.create_sub_channel(SubChannelOptions::new("before")).unwrap();
    let mut events = top.subscribe();

    let host_port = top.listen(0, "127.0.0.1").unwrap().await.unwrap();
    let port = top.address().unwrap().port();
    assert_eq!(host_port, format!("127.0.0.1:{port}"));
    assert_eq!(top.host_port().as_deref(), Some(host_port.as_str()));
    assert!(top.is_listening());

    match events.recv().await.unwrap() {
        ChannelEvent::Listening { host_port: announced } => assert_eq!(announced, host_port),
        other => panic!("unexpected event {other:?}"),
    }

    let after = top.create_sub_channel(SubChannelOptions::new("after")).unwrap();
    for sub in [&before, &after] {
        assert_eq!(sub.host_port().as_deref(), Some(host_port.as_str()));
        assert_eq!(sub.address(), top.address());
        assert!(!sub.is_listening());
    }

    top.close().unwrap().await;
}

#[tokio::test]
async fn sub_channel_keeps_its_own_host_port() {
    let top = Channel::new(ChannelOptions::default());
    let sub = top.create_sub_channel(SubChannelOptions::new("own")).unwrap();
    let own = sub.listen(0, "127.0.0.1").unwrap().await.unwrap();
    let top_hp = top.listen(0, "127.0.0.1").unwrap().await.unwrap();

    assert_ne!(own, top_hp);
    assert_eq!(sub.host_port(), Some(own));
    assert_ne!(sub.address(), top.address());

    top.close().unwrap().await;
    assert!(sub.is_destroyed());
}

#[tokio::test]
async fn listen_preconditions() {
    let channel = Channel::new(ChannelOptions::default());
    assert!(matches!(channel.listen(0, ""), Err(ChannelError::MissingHost)));
    assert!(matches!(
        channel.listen(4040, "0.0.0.0"),
        Err(ChannelError::WildcardHost { .. })
    ));

    // Rejected preconditions do not count as having listened.
    let first = channel.listen(0, "127.0.0.1").unwrap();
    // The bind has not run yet; the second call still fails.
    assert!(matches!(
        channel.listen(0, "127.0.0.1"),
        Err(ChannelError::AlreadyListening { host_port: None })
    ));
    let host_port = first.await.unwrap();
    assert!(matches!(
        channel.listen(0, "127.0.0.1"),
        Err(ChannelError::AlreadyListening { host_port: Some(ref hp) }) if *hp == host_port
    ));

    channel.close().unwrap().await;
}

#[tokio::test]
async fn bind_failure_is_reported_not_returned() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let channel = Channel::new(ChannelOptions::default());
    let mut events = channel.subscribe();
    let listening = channel.listen(port, "127.0.0.1").unwrap();

    let err = listening.await.unwrap_err();
    assert!(matches!(err, ChannelError::AddrInUse { requested_port, .. } if requested_port == port));
    match events.recv().await.unwrap() {
        ChannelEvent::Error(ChannelError::AddrInUse { host, .. }) => assert_eq!(host, "127.0.0.1"),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(!channel.is_listening());
    assert!(channel.host_port().is_none());

    channel.close().unwrap().await;
}

#[tokio::test]
async fn close_during_bind_discards_the_socket() {
    let channel = Channel::new(ChannelOptions::default());
    let listening = channel.listen(0, "127.0.0.1").unwrap();
    let closed = channel.close().unwrap();

    assert!(matches!(
        listening.await,
        Err(ChannelError::UseAfterClose { operation: "listen" })
    ));
    closed.await;
    assert!(!channel.is_listening());
    assert!(channel.host_port().is_none());
    assert!(channel.address().is_none());
}

#[tokio::test]
async fn close_waits_for_every_owned_resource() {
    init_tracing();
    let factory = Arc::new(MockConnectionFactory::new().hold_close());
    let pool = Arc::new(RecordingPeerPool::new().hold_close());
    let top = Channel::new(
        ChannelOptions::default()
            .connection_factory(factory.clone())
            .peer_pool(pool.clone()),
    );
    let subs: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|name| top.create_sub_channel(SubChannelOptions::new(name)).unwrap())
        .collect();

    let mut events = top.subscribe();
    let host_port = top.listen(0, "127.0.0.1").unwrap().await.unwrap();
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(&host_port).await.unwrap());
        next_connection(&mut events).await;
    }
    assert_eq!(top.inbound_connection_count(), 3);

    let mut closed = top.close().unwrap();
    assert!(top.is_destroyed());
    assert!(subs.iter().all(|s| s.is_destroyed()));

    // Connections and pool are held open.
    assert!(tokio::time::timeout(Duration::from_millis(50), &mut closed)
        .await
        .is_err());
    assert!(factory.created().iter().all(|c| c.close_calls() == 1));
    assert_eq!(pool.close_calls(), 1);

    factory.release_all();
    assert!(tokio::time::timeout(Duration::from_millis(50), &mut closed)
        .await
        .is_err());

    pool.release_close();
    tokio::time::timeout(Duration::from_secs(5), closed)
        .await
        .expect("close should complete once every resource has");
    assert!(top.address().is_none());
}

#[tokio::test]
async fn second_close_fails() {
    let channel = Channel::new(ChannelOptions::default());
    channel.listen(0, "127.0.0.1").unwrap().await.unwrap();
    channel.close().unwrap().await;

    assert!(matches!(channel.close(), Err(ChannelError::DoubleClose)));
    assert!(channel.is_destroyed());
}

#[tokio::test]
async fn real_connections_are_tracked_and_closed() {
    init_tracing();
    let reporter = Arc::new(RecordingReporter::default());
    let top = Channel::new(
        ChannelOptions::default()
            .force_trace(true)
            .trace_reporter(reporter.clone()),
    );
    let mut events = top.subscribe();
    let host_port = top.listen(0, "127.0.0.1").unwrap().await.unwrap();

    let mut client = TcpStream::connect(&host_port).await.unwrap();
    next_connection(&mut events).await;
    let local = client.local_addr().unwrap().to_string();
    assert_eq!(top.server().remote_addrs(), vec![local]);

    top.close().unwrap().await;
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    let spans = reporter.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "connection.in");
    assert_eq!(spans[0].endpoint.as_deref(), Some(client.local_addr().unwrap().to_string().as_str()));
}

#[tokio::test]
async fn client_disconnect_removes_table_entry() {
    let top = Channel::new(ChannelOptions::default());
    let mut events = top.subscribe();
    let host_port = top.listen(0, "127.0.0.1").unwrap().await.unwrap();

    let client = TcpStream::connect(&host_port).await.unwrap();
    next_connection(&mut events).await;
    assert_eq!(top.inbound_connection_count(), 1);

    drop(client);
    for _ in 0..100 {
        if top.inbound_connection_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(top.inbound_connection_count(), 0);

    top.close().unwrap().await;
}

#[tokio::test]
async fn close_completes_while_a_client_floods_the_socket() {
    init_tracing();
    let top = Channel::new(ChannelOptions::default());
    let mut events = top.subscribe();
    let host_port = top.listen(0, "127.0.0.1").unwrap().await.unwrap();

    let mut client = TcpStream::connect(&host_port).await.unwrap();
    next_connection(&mut events).await;
    tokio::spawn(async move {
        let chunk = vec![0u8; 64 * 1024];
        for _ in 0..256 {
            if client.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(500)).await;

    let closed = top.close().unwrap();
    tokio::time::timeout(Duration::from_secs(3), closed)
        .await
        .expect("close should complete while the client is still sending");
    assert!(top.is_destroyed());
}

//! Sub-channel hierarchy: creation rules, shared peer pool, handler wiring.

use std::sync::Arc;

use skein::{
    Bytes, Call, Channel, ChannelError, ChannelOptions, CustomHandler, ErrorCode, Handler,
    HandlerFuture, HandlerKind, Peer, PeerPool, RequestOptions, RequestTarget, SubChannelOptions,
};
use skein_testkit::{init_tracing, RecordingPeerPool};

fn top_with_pool() -> (Arc<Channel>, Arc<RecordingPeerPool>) {
    let pool = Arc::new(RecordingPeerPool::new());
    let top = Channel::new(ChannelOptions::default().peer_pool(pool.clone()));
    (top, pool)
}

fn same_pool(a: &Arc<dyn PeerPool>, b: &Arc<dyn PeerPool>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[test]
fn one_entry_per_distinct_service_name() {
    init_tracing();
    let (top, _) = top_with_pool();
    for name in ["users", "billing", "auth"] {
        let sub = top.create_sub_channel(SubChannelOptions::new(name)).unwrap();
        assert_eq!(sub.service_name(), name);
        assert!(!sub.is_top_channel());
    }
    assert_eq!(top.sub_channel_names(), vec!["auth", "billing", "users"]);

    let err = top
        .create_sub_channel(SubChannelOptions::new("billing"))
        .unwrap_err();
    assert!(matches!(err, ChannelError::DuplicateSubChannel { ref service_name } if service_name == "billing"));
    assert_eq!(top.sub_channel_names().len(), 3);
}

#[test]
fn sub_channels_cannot_nest() {
    let (top, _) = top_with_pool();
    let sub = top.create_sub_channel(SubChannelOptions::new("a")).unwrap();
    let err = sub
        .create_sub_channel(SubChannelOptions::new("b").trace(true))
        .unwrap_err();
    assert!(matches!(err, ChannelError::HierarchyDepth { ref service_name } if service_name == "a"));

    let standalone = Channel::new(ChannelOptions::default().service_name("solo"));
    assert!(!standalone.is_top_channel());
    assert!(matches!(
        standalone.create_sub_channel(SubChannelOptions::new("b")),
        Err(ChannelError::HierarchyDepth { .. })
    ));
}

#[test]
fn service_name_is_required() {
    let (top, _) = top_with_pool();
    assert!(matches!(
        top.create_sub_channel(SubChannelOptions::default()),
        Err(ChannelError::MissingServiceName)
    ));
}

#[test]
fn sub_channels_share_the_top_pool() {
    let (top, pool) = top_with_pool();
    let given = Arc::new(Peer::new("10.0.0.5:4040"));
    let a = top
        .create_sub_channel(
            SubChannelOptions::new("a")
                .peer("10.0.0.1:4040")
                .peer(given.clone()),
        )
        .unwrap();
    let b = top
        .create_sub_channel(SubChannelOptions::new("b").peer("10.0.0.1:4040"))
        .unwrap();

    assert!(same_pool(top.peers(), a.peers()));
    assert!(same_pool(a.peers(), b.peers()));

    // Addresses resolve through the shared pool, so both views hold the same peer.
    let a_view = a.peers_view();
    let b_view = b.peers_view();
    assert_eq!(a_view.len(), 2);
    assert!(Arc::ptr_eq(&a_view[0], &b_view[0]));
    assert!(Arc::ptr_eq(&a_view[1], &given));
    assert_eq!(pool.peer_list().host_ports(), vec!["10.0.0.1:4040"]);
}

#[test]
fn back_reference_does_not_keep_top_alive() {
    let (top, _) = top_with_pool();
    let sub = top.create_sub_channel(SubChannelOptions::new("a")).unwrap();
    assert!(Arc::ptr_eq(&sub.top_channel().unwrap(), &top));
    drop(top);
    assert!(sub.top_channel().is_none());
}

#[test]
fn sub_options_are_inherited_and_refined() {
    let top = Channel::new(
        ChannelOptions::default()
            .process_name("proc[7]")
            .trace(false),
    );
    let sub = top
        .create_sub_channel(
            SubChannelOptions::new("svc")
                .trace(true)
                .request_defaults(skein::RequestDefaultsPatch {
                    retry_limit: Some(3),
                    ..Default::default()
                }),
        )
        .unwrap();

    assert_eq!(sub.options().process_name, "proc[7]");
    assert_eq!(sub.options().service_name.as_deref(), Some("svc"));
    assert!(sub.tracer().is_enabled());
    assert!(!top.tracer().is_enabled());
    assert_eq!(sub.tracer().service_name(), "svc");
    assert_eq!(sub.request_defaults().retry_limit, Some(3));
    assert_eq!(sub.request_defaults().timeout, top.request_defaults().timeout);
}

#[test]
fn register_only_works_on_endpoint_handlers() {
    let (top, _) = top_with_pool();
    assert_eq!(top.handler().kind(), HandlerKind::ServiceName);
    let err = top
        .register("echo", |call: Call| async move { Ok(call.arg3) })
        .unwrap_err();
    assert!(matches!(err, ChannelError::TopLevelRegister { ref endpoint } if endpoint == "echo"));

    let sub = top.create_sub_channel(SubChannelOptions::new("svc")).unwrap();
    assert_eq!(sub.handler().kind(), HandlerKind::Endpoint);
    sub.register("echo", |call: Call| async move { Ok(call.arg3) })
        .unwrap();

    struct Deny;
    impl CustomHandler for Deny {
        fn handle(&self, _call: Call) -> HandlerFuture {
            Box::pin(async { Err::<Bytes, _>(skein::HandlerError::new(ErrorCode::Declined, "no")) })
        }
    }
    let custom = top
        .create_sub_channel(SubChannelOptions::new("custom").handler(Handler::custom(Deny)))
        .unwrap();
    let err = custom
        .register("echo", |call: Call| async move { Ok(call.arg3) })
        .unwrap_err();
    assert!(matches!(
        err,
        ChannelError::InvalidHandlerForRegister { handler: "custom" }
    ));
}

#[tokio::test]
async fn top_handler_dispatches_to_sub_channel_endpoints() {
    let (top, _) = top_with_pool();
    let sub = top.create_sub_channel(SubChannelOptions::new("svc")).unwrap();
    sub.register("upper", |call: Call| async move {
        Ok(Bytes::from(
            String::from_utf8_lossy(&call.arg3).to_uppercase(),
        ))
    })
    .unwrap();

    let out = top
        .handler()
        .handle(Call::new("svc", "upper").with_body("", "shout"))
        .await
        .unwrap();
    assert_eq!(&out[..], b"SHOUT");

    let err = top
        .handler()
        .handle(Call::new("missing", "upper"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::BadRequest);
}

#[tokio::test]
async fn sub_channel_close_only_closes_its_own_peers() {
    let (top, pool) = top_with_pool();
    let own = Arc::new(Peer::new("10.0.0.1:1"));
    let a = top
        .create_sub_channel(SubChannelOptions::new("a").peer(own.clone()))
        .unwrap();
    let b = top
        .create_sub_channel(SubChannelOptions::new("b").peer("10.0.0.2:2"))
        .unwrap();

    a.close().unwrap().await;
    assert!(a.is_destroyed());
    assert!(own.is_closed());
    assert!(!b.peers_view()[0].is_closed());
    assert_eq!(pool.close_calls(), 0);

    // The top channel skips the already-closed sub-channel and closes the pool.
    top.close().unwrap().await;
    assert!(b.is_destroyed());
    assert!(b.peers_view()[0].is_closed());
    assert_eq!(pool.close_calls(), 1);
}

#[tokio::test]
async fn closing_a_sub_channel_leaves_shared_peers_open() {
    let (top, pool) = top_with_pool();
    let given = Arc::new(Peer::new("10.0.0.7:7"));
    let a = top
        .create_sub_channel(
            SubChannelOptions::new("a")
                .peer("10.0.0.1:1")
                .peer(given.clone()),
        )
        .unwrap();
    let b = top
        .create_sub_channel(
            SubChannelOptions::new("b")
                .peer("10.0.0.1:1")
                .peer(given.clone()),
        )
        .unwrap();

    a.close().unwrap().await;
    assert!(b.peers_view().iter().all(|p| !p.is_closed()));
    assert!(!pool.peer_list().get("10.0.0.1:1").unwrap().is_closed());
    assert!(!top.peers().add("10.0.0.1:1").is_closed());

    let req = b
        .request(RequestOptions::new().host("10.0.0.1:1"))
        .unwrap();
    assert_eq!(req.target(), &RequestTarget::Peer("10.0.0.1:1".into()));

    // Once its last holder closes, the directly given peer goes too.
    b.close().unwrap().await;
    assert!(given.is_closed());
    assert!(!pool.peer_list().get("10.0.0.1:1").unwrap().is_closed());
    assert_eq!(pool.close_calls(), 0);

    top.close().unwrap().await;
    assert!(pool.peer_list().get("10.0.0.1:1").unwrap().is_closed());
}

#[tokio::test]
async fn no_sub_channels_after_close() {
    let (top, _) = top_with_pool();
    top.close().unwrap().await;
    assert!(matches!(
        top.create_sub_channel(SubChannelOptions::new("late")),
        Err(ChannelError::UseAfterClose { .. })
    ));
}

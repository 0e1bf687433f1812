mod common;

use std::time::{Duration, Instant};

use commander_net::{Error, Event, EventKind, Flag, Message, Phase, ReconnectPolicy, BROADCAST};
use serde_json::json;

use common::{
    client, collector, drain, next_event, start_server, wait_for_event, wait_until, Proxy,
};

fn echo(text: &str) -> Message {
    Message::from_value("echo", json!({ "message": text })).unwrap()
}

#[tokio::test]
async fn test_connect_registers_session() {
    let (server, addr) = start_server().await;
    let (on_server_connect, mut server_connects) = collector();
    server.on(EventKind::Connect, on_server_connect);

    let client = client(addr.port(), "abc");
    let (on_connect, mut connects) = collector();
    client.subscribe("on_connect", on_connect).unwrap();

    client.connect().await.unwrap();

    match next_event(&mut connects).await {
        Event::Connect { client_id } => assert_eq!(client_id, "abc"),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(client.state().contains(Flag::Connected));
    assert!(client.state().contains(Flag::Ok));
    assert_eq!(server.sessions().await, vec!["abc".to_string()]);

    match next_event(&mut server_connects).await {
        Event::Connect { client_id } => assert_eq!(client_id, "abc"),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(server
        .session_state("abc")
        .await
        .unwrap()
        .contains(Flag::Connected));

    client.flush_events().await;
    assert!(drain(&mut connects).is_empty());

    client.disconnect().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let (server, addr) = start_server().await;

    let first = client(addr.port(), "first");
    let second = client(addr.port(), "second");
    let (on_first, mut first_rx) = collector();
    let (on_second, mut second_rx) = collector();
    first.on(EventKind::Message, on_first);
    second.on(EventKind::Message, on_second);

    first.connect().await.unwrap();
    second.connect().await.unwrap();
    wait_until(|| first.state().is_connected() && second.state().is_connected()).await;

    server.send(BROADCAST, echo("hello")).await.unwrap();

    for rx in [&mut first_rx, &mut second_rx] {
        match next_event(rx).await {
            Event::Message { origin, message } => {
                assert!(origin.is_none());
                assert_eq!(message.subject(), "echo");
                assert_eq!(message.get_str("message"), Some("hello"));
                assert_eq!(message.payload().len(), 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    first.flush_events().await;
    second.flush_events().await;
    assert!(drain(&mut first_rx).is_empty());
    assert!(drain(&mut second_rx).is_empty());

    first.disconnect().await.unwrap();
    second.disconnect().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_targeted_messages_arrive_in_order() {
    let (server, addr) = start_server().await;
    let client = client(addr.port(), "abc");
    let (on_message, mut messages) = collector();
    client.on(EventKind::Message, on_message);

    client.connect().await.unwrap();
    wait_until(|| client.state().is_connected()).await;

    for n in 0..50 {
        let msg = Message::from_value("count", json!({ "n": n })).unwrap();
        server.send("abc", msg).await.unwrap();
    }

    for n in 0..50 {
        match next_event(&mut messages).await {
            Event::Message { message, .. } => {
                assert_eq!(message.payload()["n"], json!(n));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    assert!(matches!(
        server.send("someone-else", echo("hi")).await,
        Err(Error::UnknownClient(_))
    ));

    client.disconnect().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_message_carries_origin() {
    let (server, addr) = start_server().await;
    let (on_message, mut messages) = collector();
    server.subscribe("Message", on_message).unwrap();

    let client = client(addr.port(), "abc");
    client.connect().await.unwrap();
    wait_until(|| client.state().is_connected()).await;

    client.send(echo("ping")).unwrap();

    match next_event(&mut messages).await {
        Event::Message { origin, message } => {
            assert_eq!(origin.as_deref(), Some("abc"));
            assert_eq!(message.get_str("message"), Some("ping"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    client.disconnect().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_id_rejected() {
    let (server, addr) = start_server().await;

    let original = client(addr.port(), "dup");
    let (on_message, mut messages) = collector();
    original.on(EventKind::Message, on_message);
    original.connect().await.unwrap();
    wait_until(|| original.state().is_connected()).await;

    let intruder = client(addr.port(), "dup");
    let (on_state, mut states) = collector();
    let (on_connect, mut intruder_connects) = collector();
    intruder.on(EventKind::StateChange, on_state);
    intruder.on(EventKind::Connect, on_connect);
    intruder.connect().await.unwrap();

    wait_for_event(&mut states, |e| {
        matches!(e, Event::StateChange { transition, .. } if transition.to.phase() == Phase::ConnectFailed)
    })
    .await;
    wait_until(|| intruder.state().phase() == Phase::NotConnected).await;
    assert!(matches!(intruder.take_last_error(), Some(Error::Rejected(_))));

    intruder.flush_events().await;
    assert!(drain(&mut intruder_connects).is_empty());

    // The original session is untouched
    assert!(original.state().is_connected());
    assert_eq!(server.sessions().await, vec!["dup".to_string()]);
    server.send("dup", echo("still here")).await.unwrap();
    match next_event(&mut messages).await {
        Event::Message { message, .. } => {
            assert_eq!(message.get_str("message"), Some("still here"))
        }
        other => panic!("unexpected event {:?}", other),
    }

    original.disconnect().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_twice_is_quiet() {
    let (server, addr) = start_server().await;
    let (on_server_disconnect, mut server_disconnects) = collector();
    server.on(EventKind::Disconnect, on_server_disconnect);

    let client = client(addr.port(), "abc");
    let (on_disconnect, mut disconnects) = collector();
    client.subscribe("on-disconnect", on_disconnect).unwrap();

    client.connect().await.unwrap();
    wait_until(|| client.state().is_connected()).await;

    client.disconnect().await.unwrap();
    client.disconnect().await.unwrap();

    let state = client.state();
    assert_eq!(state.phase(), Phase::NotConnected);
    assert!(!state.contains(Flag::UnexpectedClose));

    client.flush_events().await;
    assert_eq!(drain(&mut disconnects).len(), 1);

    // The clean-leave notice reaches the server as one disconnect
    match next_event(&mut server_disconnects).await {
        Event::Disconnect { client_id } => assert_eq!(client_id, "abc"),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(server.sessions().await.is_empty());

    assert!(matches!(client.send(echo("late")), Err(Error::NotConnected)));

    server.stop().await.unwrap();
    server.flush_events().await;
    assert!(drain(&mut server_disconnects).is_empty());
}

#[tokio::test]
async fn test_stop_notifies_clients() {
    let (server, addr) = start_server().await;
    let (on_server_disconnect, mut server_disconnects) = collector();
    server.on(EventKind::Disconnect, on_server_disconnect);

    let client = client(addr.port(), "abc");
    let (on_shutdown, mut shutdowns) = collector();
    let (on_reconnect, mut reconnects) = collector();
    let (on_message, mut messages) = collector();
    client.subscribe("onServerShutdown", on_shutdown).unwrap();
    client.on(EventKind::Reconnect, on_reconnect);
    client.on(EventKind::Message, on_message);

    client.connect().await.unwrap();
    wait_until(|| client.state().is_connected()).await;

    server.stop().await.unwrap();
    server.stop().await.unwrap();
    assert!(!server.is_running());

    assert!(matches!(next_event(&mut shutdowns).await, Event::ServerShutdown));
    wait_until(|| client.state().phase() == Phase::NotConnected).await;
    assert!(!client.state().contains(Flag::UnexpectedClose));

    server.flush_events().await;
    assert_eq!(drain(&mut server_disconnects).len(), 1);

    client.flush_events().await;
    assert!(drain(&mut shutdowns).is_empty());
    assert!(drain(&mut reconnects).is_empty());
    assert!(drain(&mut messages).is_empty());

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_connect_again_after_failed_attempt() {
    let (server, addr) = start_server().await;
    let client = client(addr.port(), "abc");

    // Nothing listening yet: the attempt fails and settles
    server.stop().await.unwrap();
    client.connect().await.unwrap();
    wait_until(|| client.take_last_error().is_some()).await;
    wait_until(|| client.state().phase() == Phase::NotConnected).await;

    server.set_port(addr.port()).unwrap();
    server.start().await.unwrap();

    client.connect().await.unwrap();
    wait_until(|| client.state().is_connected()).await;

    client.disconnect().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_severed_session_is_reaped() {
    let (server, addr) = start_server().await;
    let proxy = Proxy::start(addr).await;

    let (on_connect, mut server_connects) = collector();
    let (on_disconnect, mut server_disconnects) = collector();
    let (on_state, mut server_states) = collector();
    server.on(EventKind::Connect, on_connect);
    server.on(EventKind::Disconnect, on_disconnect);
    server.on(EventKind::StateChange, on_state);

    let client = client(proxy.port(), "abc");
    client.set_reconnect_policy(ReconnectPolicy::disabled()).unwrap();
    client.connect().await.unwrap();
    next_event(&mut server_connects).await;
    server.flush_events().await;
    drain(&mut server_states);

    proxy.sever();

    match wait_for_event(&mut server_disconnects, |_| true).await {
        Event::Disconnect { client_id } => assert_eq!(client_id, "abc"),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(server.sessions().await.is_empty());
    assert!(server.session_state("abc").await.is_none());

    server.flush_events().await;
    assert!(drain(&mut server_disconnects).is_empty());

    let transitions: Vec<_> = drain(&mut server_states)
        .into_iter()
        .filter_map(|e| match e {
            Event::StateChange {
                client_id: Some(id),
                transition,
            } if id == "abc" => Some(transition),
            _ => None,
        })
        .collect();
    let phases: Vec<_> = transitions.iter().map(|t| t.to.phase()).collect();
    assert_eq!(phases, vec![Phase::Disconnecting, Phase::NotConnected]);
    assert!(transitions[0].to.unexpected_close());

    // The server itself keeps running
    assert!(server.is_running());

    client.disconnect().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_right_after_settling() {
    let (server, addr) = start_server().await;
    let client = client(addr.port(), "abc");

    client.connect().await.unwrap();
    wait_until(|| client.state().is_connected()).await;

    // Catch NOT_CONNECTED as early as possible, while the task may still be returning
    server.stop().await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while client.state().phase() != Phase::NotConnected {
        assert!(Instant::now() < deadline, "client never settled");
        std::hint::spin_loop();
    }
    client.connect().await.unwrap();

    // Nothing is listening any more, so the fresh attempt fails and settles
    wait_until(|| client.take_last_error().is_some()).await;
    wait_until(|| client.state().phase() == Phase::NotConnected).await;
    client.disconnect().await.unwrap();
}

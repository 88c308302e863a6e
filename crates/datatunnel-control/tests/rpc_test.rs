//! RPC engine behaviour over in-memory control streams

use bytes::Bytes;
use datatunnel_control::{
    CallKind, ControlBase, ControlConnection, ProtocolError, RemoteCaller, RpcError,
};
use datatunnel_proto::{ArgList, ControlStreamMessage, MessageKind, StatusCode, WireValue};
use datatunnel_transport::{in_memory_pair, ControlChannel};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Connect a client engine to a raw channel the test drives by hand
fn raw_peer(client: ControlBase) -> (ControlConnection, ControlChannel, JoinHandle<Result<(), RpcError>>) {
    let (local, remote) = in_memory_pair(64 * 1024);
    let (conn, source) = ControlConnection::from_channel(local);
    let serve = tokio::spawn({
        let conn = conn.clone();
        async move { client.serve(conn, source).await }
    });
    (conn, remote, serve)
}

/// Connect two engines to each other; returns the client-side connection
fn connected(server: ControlBase, client: ControlBase) -> ControlConnection {
    let (a, b) = in_memory_pair(64 * 1024);
    let (client_conn, client_source) = ControlConnection::from_channel(a);
    let (server_conn, server_source) = ControlConnection::from_channel(b);

    tokio::spawn({
        let conn = client_conn.clone();
        async move { client.serve(conn, client_source).await }
    });
    tokio::spawn(async move { server.serve(server_conn, server_source).await });

    client_conn
}

fn client_with<A: ArgList, R: ArgList>(method: &str, version: u32, kind: CallKind) -> ControlBase {
    let mut builder = ControlBase::builder();
    builder
        .register_client_method::<A, R>(method, version, kind)
        .unwrap();
    builder.build()
}

fn test_server() -> ControlBase {
    let mut builder = ControlBase::builder();
    builder
        .register_rpc("Echo", 1, CallKind::Request, |_ctx, (text,): (String,)| async move {
            Ok::<_, ProtocolError>((format!("v1:{}", text),))
        })
        .unwrap()
        .register_rpc("Echo", 3, CallKind::Request, |_ctx, (text,): (String,)| async move {
            Ok::<_, ProtocolError>((format!("v3:{}", text),))
        })
        .unwrap()
        .register_rpc("Port", 1, CallKind::Request, |_ctx, (port,): (u16,)| async move {
            Ok::<_, ProtocolError>((u32::from(port) + 1,))
        })
        .unwrap()
        .register_rpc("Panic", 1, CallKind::Request, |_ctx, (): ()| async move {
            if true {
                panic!("handler exploded");
            }
            Ok::<_, ProtocolError>((0i32,))
        })
        .unwrap()
        .register_rpc("Secret", 1, CallKind::Request, |_ctx, (): ()| async move {
            Ok::<_, ProtocolError>(("classified".to_string(),))
        })
        .unwrap()
        .register_rpc("Reject", 1, CallKind::Request, |_ctx, (code,): (u32,)| async move {
            Err::<(i32,), _>(ProtocolError::application(StatusCode(code), "rejected"))
        })
        .unwrap()
        .with_permission_check(|ctx| ctx.method != "Secret");
    builder.build()
}

#[tokio::test]
async fn test_responses_in_permuted_order() {
    let client = client_with::<(i32,), (i32,)>("Double", 1, CallKind::Request);
    let caller: RemoteCaller<(i32,), (i32,)> = client.new_remote_caller("Double", 1).unwrap();
    let (conn, mut remote, _serve) = raw_peer(client);

    let calls: Vec<_> = (1..=8)
        .map(|n| {
            let caller = caller.clone();
            let conn = conn.clone();
            tokio::spawn(async move { (n, caller.call(&conn, (n,)).await) })
        })
        .collect();

    let mut requests = Vec::new();
    while requests.len() < 8 {
        requests.push(remote.source.recv().await.unwrap().unwrap());
    }
    assert_eq!(conn.pending_calls(), 8);

    // Ids are distinct and increasing from 1
    let mut ids: Vec<u64> = requests.iter().map(|r| r.id()).collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=8).collect::<Vec<u64>>());

    requests.reverse();
    requests.swap(1, 5);
    for request in requests {
        let (n,) = <(i32,)>::decode_all(&request.body.values).unwrap();
        remote
            .sink
            .send(ControlStreamMessage::response(
                request.id(),
                (n * 2,).encode_all().unwrap(),
            ))
            .await
            .unwrap();
    }

    for call in calls {
        let (n, result) = call.await.unwrap();
        assert_eq!(result.unwrap(), (n * 2,));
    }
    assert_eq!(conn.pending_calls(), 0);
}

#[tokio::test]
async fn test_version_resolution() {
    let mut client = ControlBase::builder();
    client
        .register_client_method::<(String,), (String,)>("Echo", 1, CallKind::Request)
        .unwrap()
        .register_client_method::<(String,), (String,)>("Echo", 2, CallKind::Request)
        .unwrap()
        .register_client_method::<(String,), (String,)>("Echo", 3, CallKind::Request)
        .unwrap();
    let client = client.build();
    let conn = connected(test_server(), client.clone());

    let v1 = client.new_remote_caller::<(String,), (String,)>("Echo", 1).unwrap();
    assert_eq!(v1.call(&conn, ("a".to_string(),)).await.unwrap().0, "v1:a");

    let v3 = client.new_remote_caller::<(String,), (String,)>("Echo", 3).unwrap();
    assert_eq!(v3.call(&conn, ("b".to_string(),)).await.unwrap().0, "v3:b");

    let v2 = client.new_remote_caller::<(String,), (String,)>("Echo", 2).unwrap();
    let err = v2.call(&conn, ("c".to_string(),)).await.unwrap_err();
    assert_eq!(err.status_code(), Some(StatusCode::VERSION_NOT_SUPPORTED));
}

#[tokio::test]
async fn test_version_zero_selects_highest() {
    let (a, mut remote) = in_memory_pair(64 * 1024);
    let (conn, source) = ControlConnection::from_channel(a);
    tokio::spawn(async move { test_server().serve(conn, source).await });

    remote
        .sink
        .send(ControlStreamMessage::request(
            1,
            "Echo",
            0,
            ("latest".to_string(),).encode_all().unwrap(),
        ))
        .await
        .unwrap();

    let reply = remote.source.recv().await.unwrap().unwrap();
    assert!(reply.body.status_code.is_ok());
    assert_eq!(String::decode(&reply.body.values[0]).unwrap(), "v3:latest");
}

#[tokio::test]
async fn test_timeout_removes_pending_call() {
    let client = client_with::<(i32,), (i32,)>("Slow", 1, CallKind::Request);
    let caller = client.new_remote_caller::<(i32,), (i32,)>("Slow", 1).unwrap();
    let (conn, mut remote, _serve) = raw_peer(client);

    let started = tokio::time::Instant::now();
    let err = caller
        .call_with_timeout(&conn, Duration::from_millis(50), (1,))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout(d) if d == Duration::from_millis(50)));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(conn.pending_calls(), 0);

    // The late response is dropped and does not leak into the next call
    let stale = remote.source.recv().await.unwrap().unwrap();
    remote
        .sink
        .send(ControlStreamMessage::response(stale.id(), (-1,).encode_all().unwrap()))
        .await
        .unwrap();

    let next = tokio::spawn({
        let conn = conn.clone();
        async move { caller.call(&conn, (2,)).await }
    });
    let request = remote.source.recv().await.unwrap().unwrap();
    assert!(request.id() > stale.id());
    remote
        .sink
        .send(ControlStreamMessage::response(request.id(), (42,).encode_all().unwrap()))
        .await
        .unwrap();

    assert_eq!(next.await.unwrap().unwrap(), (42,));
}

/// Connection whose peer never reads, so writes stall once the pipe is full
fn stalled_stream() -> (ControlConnection, ControlChannel) {
    let (local, remote) = in_memory_pair(64);
    let (conn, _source) = ControlConnection::from_channel(local);
    (conn, remote)
}

#[tokio::test]
async fn test_timeout_applies_while_send_is_blocked() {
    let client = client_with::<(String,), (String,)>("Echo", 1, CallKind::Request);
    let caller = client
        .new_remote_caller::<(String,), (String,)>("Echo", 1)
        .unwrap();
    let (conn, _remote) = stalled_stream();

    let started = tokio::time::Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        caller.call_with_timeout(&conn, Duration::from_millis(50), ("x".repeat(4096),)),
    )
    .await
    .expect("call outlived its timeout");

    assert!(matches!(result, Err(RpcError::Timeout(_))));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(conn.pending_calls(), 0);
}

#[tokio::test]
async fn test_cancel_and_close_apply_while_send_is_blocked() {
    let client = client_with::<(String,), (String,)>("Echo", 1, CallKind::Request);
    let caller = client
        .new_remote_caller::<(String,), (String,)>("Echo", 1)
        .unwrap();
    let (conn, _remote) = stalled_stream();

    let token = CancellationToken::new();
    let cancelled = tokio::spawn({
        let (caller, conn, token) = (caller.clone(), conn.clone(), token.clone());
        async move {
            caller
                .call_with(&conn, Some(&token), None, ("x".repeat(4096),))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), cancelled)
        .await
        .expect("cancelled call did not return")
        .unwrap();
    assert!(matches!(result, Err(RpcError::Cancelled)));

    // The stream is still stalled; closing the connection ends the next call
    let closed = tokio::spawn({
        let (caller, conn) = (caller.clone(), conn.clone());
        async move { caller.call(&conn, ("y".to_string(),)).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    conn.close();
    let result = tokio::time::timeout(Duration::from_secs(2), closed)
        .await
        .expect("call did not end on close")
        .unwrap();
    assert!(matches!(result, Err(RpcError::ConnectionFinished)));
    assert_eq!(conn.pending_calls(), 0);
}

#[tokio::test]
async fn test_cancellation_is_isolated() {
    let client = client_with::<(i32,), (i32,)>("Wait", 1, CallKind::Request);
    let caller = client.new_remote_caller::<(i32,), (i32,)>("Wait", 1).unwrap();
    let (conn, mut remote, _serve) = raw_peer(client);

    let token_a = CancellationToken::new();
    let call_a = tokio::spawn({
        let (caller, conn, token) = (caller.clone(), conn.clone(), token_a.clone());
        async move { caller.call_with(&conn, Some(&token), None, (1,)).await }
    });
    let call_b = tokio::spawn({
        let (caller, conn) = (caller.clone(), conn.clone());
        async move { caller.call(&conn, (2,)).await }
    });

    let first = remote.source.recv().await.unwrap().unwrap();
    let second = remote.source.recv().await.unwrap().unwrap();
    assert_eq!(conn.pending_calls(), 2);

    token_a.cancel();
    assert!(matches!(call_a.await.unwrap(), Err(RpcError::Cancelled)));
    assert_eq!(conn.pending_calls(), 1);

    for request in [first, second] {
        let (n,) = <(i32,)>::decode_all(&request.body.values).unwrap();
        remote
            .sink
            .send(ControlStreamMessage::response(request.id(), (n + 100,).encode_all().unwrap()))
            .await
            .unwrap();
    }

    assert_eq!(call_b.await.unwrap().unwrap(), (102,));
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_dropped_call_future_removes_pending_call() {
    let client = client_with::<(i32,), (i32,)>("Wait", 1, CallKind::Request);
    let caller = client.new_remote_caller::<(i32,), (i32,)>("Wait", 1).unwrap();
    let (conn, mut remote, _serve) = raw_peer(client);

    let call = tokio::spawn({
        let conn = conn.clone();
        async move { caller.call(&conn, (1,)).await }
    });
    remote.source.recv().await.unwrap().unwrap();
    assert_eq!(conn.pending_calls(), 1);

    call.abort();
    let _ = call.await;
    assert_eq!(conn.pending_calls(), 0);
}

#[tokio::test]
async fn test_handler_panic_becomes_server_error() {
    let client = client_with::<(), (i32,)>("Panic", 1, CallKind::Request);
    let panicky = client.new_remote_caller::<(), (i32,)>("Panic", 1).unwrap();
    let conn = connected(test_server(), client);

    let err = panicky.call(&conn, ()).await.unwrap_err();
    assert_eq!(err.status_code(), Some(StatusCode::SERVER_ERROR));
    assert!(err.to_string().contains("handler exploded"));

    // The read loop survives and keeps serving
    let err = panicky.call(&conn, ()).await.unwrap_err();
    assert_eq!(err.status_code(), Some(StatusCode::SERVER_ERROR));
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_permission_check_forbids() {
    let client = client_with::<(), (String,)>("Secret", 1, CallKind::Request);
    let caller = client.new_remote_caller::<(), (String,)>("Secret", 1).unwrap();
    let conn = connected(test_server(), client);

    let err = caller.call(&conn, ()).await.unwrap_err();
    assert_eq!(err.status_code(), Some(StatusCode::FORBIDDEN));
}

#[tokio::test]
async fn test_application_error_propagates() {
    let client = client_with::<(u32,), (i32,)>("Reject", 1, CallKind::Request);
    let caller = client.new_remote_caller::<(u32,), (i32,)>("Reject", 1).unwrap();
    let conn = connected(test_server(), client);

    match caller.call(&conn, (10042,)).await.unwrap_err() {
        RpcError::Protocol(e) => {
            assert_eq!(e.code, StatusCode(10042));
            assert_eq!(e.reason, "rejected");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_argument_mismatches() {
    let mut client = ControlBase::builder();
    client
        .register_client_method::<(String, i32), (String,)>("Echo", 1, CallKind::Request)
        .unwrap()
        .register_client_method::<(String,), (u32,)>("Port", 1, CallKind::Request)
        .unwrap()
        .register_client_method::<(), ()>("Missing", 1, CallKind::Request)
        .unwrap();
    let client = client.build();
    let conn = connected(test_server(), client.clone());

    let too_many = client
        .new_remote_caller::<(String, i32), (String,)>("Echo", 1)
        .unwrap();
    let err = too_many.call(&conn, ("x".to_string(), 1)).await.unwrap_err();
    assert_eq!(err.status_code(), Some(StatusCode::INVALID_ARG_NUM));

    // Three bytes of text where a two-byte port is expected
    let wrong_type = client.new_remote_caller::<(String,), (u32,)>("Port", 1).unwrap();
    let err = wrong_type.call(&conn, ("abc".to_string(),)).await.unwrap_err();
    assert_eq!(err.status_code(), Some(StatusCode::INVALID_ARG_TYPE));

    let missing = client.new_remote_caller::<(), ()>("Missing", 1).unwrap();
    let err = missing.call(&conn, ()).await.unwrap_err();
    assert_eq!(err.status_code(), Some(StatusCode::METHOD_NOT_FOUND));
}

#[tokio::test]
async fn test_unknown_message_kind_answered() {
    let (a, mut remote) = in_memory_pair(64 * 1024);
    let (conn, source) = ControlConnection::from_channel(a);
    tokio::spawn(async move { test_server().serve(conn, source).await });

    let mut msg = ControlStreamMessage::request(11, "Echo", 1, vec![Bytes::from("x")]);
    msg.header.kind = 7;
    remote.sink.send(msg).await.unwrap();

    let reply = remote.source.recv().await.unwrap().unwrap();
    assert_eq!(reply.id(), 11);
    assert_eq!(reply.kind(), Ok(MessageKind::Response));
    assert_eq!(reply.body.status_code, StatusCode::UNKNOWN_MESSAGE_TYPE);
}

#[tokio::test]
async fn test_notify_delivered_without_reply() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut server = ControlBase::builder();
    server
        .register_rpc("Event", 1, CallKind::Notify, move |_ctx, (name, count): (String, u64)| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((name, count));
                Ok::<_, ProtocolError>(())
            }
        })
        .unwrap();

    let client = client_with::<(String, u64), ()>("Event", 1, CallKind::Notify);
    let notifier = client.new_remote_caller::<(String, u64), ()>("Event", 1).unwrap();
    let conn = connected(server.build(), client);

    notifier.notify(&conn, ("tick".to_string(), 3)).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), ("tick".to_string(), 3));
    assert_eq!(conn.pending_calls(), 0);

    // A notify stub cannot be awaited as a request
    assert!(matches!(
        notifier.call(&conn, ("tick".to_string(), 4)).await,
        Err(RpcError::KindMismatch { .. })
    ));
}

#[tokio::test]
async fn test_close_fails_pending_calls() {
    let client = client_with::<(i32,), (i32,)>("Wait", 1, CallKind::Request);
    let caller = client.new_remote_caller::<(i32,), (i32,)>("Wait", 1).unwrap();
    let (conn, mut remote, serve) = raw_peer(client);

    let call = tokio::spawn({
        let conn = conn.clone();
        async move { caller.call(&conn, (1,)).await }
    });
    remote.source.recv().await.unwrap().unwrap();

    conn.close();
    assert!(matches!(call.await.unwrap(), Err(RpcError::ConnectionFinished)));
    assert!(serve.await.unwrap().is_ok());
    assert_eq!(conn.pending_calls(), 0);

    // The peer observes the stream ending
    assert_eq!(remote.source.recv().await.unwrap(), None);
}

#[tokio::test]
async fn test_peer_close_fails_pending_calls() {
    let client = client_with::<(i32,), (i32,)>("Wait", 1, CallKind::Request);
    let caller = client.new_remote_caller::<(i32,), (i32,)>("Wait", 1).unwrap();
    let (conn, mut remote, serve) = raw_peer(client);

    let call = tokio::spawn({
        let conn = conn.clone();
        async move { caller.call(&conn, (1,)).await }
    });
    remote.source.recv().await.unwrap().unwrap();

    remote.sink.close().await.unwrap();
    assert!(matches!(call.await.unwrap(), Err(RpcError::ConnectionFinished)));
    assert!(serve.await.unwrap().is_ok());
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_running_handlers_aborted_when_serve_ends() {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel::<()>();
    let (dropped_tx, mut dropped_rx) = mpsc::unbounded_channel::<()>();

    let mut builder = ControlBase::builder();
    builder
        .register_rpc("Hold", 1, CallKind::Notify, move |_ctx, (): ()| {
            let (started, dropped) = (started_tx.clone(), dropped_tx.clone());
            async move {
                let _dropped = scopeguard::guard((), move |_| {
                    let _ = dropped.send(());
                });
                let _ = started.send(());
                std::future::pending::<()>().await;
                Ok::<_, ProtocolError>(())
            }
        })
        .unwrap();
    let server = builder.build();

    let (local, mut remote) = in_memory_pair(64 * 1024);
    let (conn, source) = ControlConnection::from_channel(local);
    let serve = tokio::spawn({
        let conn = conn.clone();
        async move { server.serve(conn, source).await }
    });

    remote
        .sink
        .send(ControlStreamMessage::notify(1, "Hold", 1, vec![]))
        .await
        .unwrap();
    started_rx.recv().await.unwrap();

    conn.close();
    serve.await.unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(2), dropped_rx.recv())
        .await
        .unwrap()
        .unwrap();
}

//! Control stream over a real loopback TCP connection

use bytes::Bytes;
use datatunnel_proto::ControlStreamMessage;
use datatunnel_transport::{framed, ControlConnector, TcpConnector};
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::test]
async fn test_tcp_control_stream_exchange() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let mut channel = framed(stream, peer.to_string());

        let mut seen = Vec::new();
        while let Some(msg) = channel.source.recv().await.unwrap() {
            channel
                .sink
                .send(ControlStreamMessage::response(msg.id(), msg.body.values.clone()))
                .await
                .unwrap();
            seen.push(msg.id());
        }
        seen
    });

    let connector = TcpConnector::new(Duration::from_secs(5));
    let mut channel = connector.connect(&addr.to_string()).await.unwrap();
    assert_eq!(channel.peer, addr.to_string());

    for id in 1..=3u64 {
        let payload = Bytes::from(format!("payload-{}", id));
        channel
            .sink
            .send(ControlStreamMessage::request(id, "Echo", 1, vec![payload.clone()]))
            .await
            .unwrap();

        let reply = channel.source.recv().await.unwrap().unwrap();
        assert_eq!(reply.id(), id);
        assert_eq!(reply.body.values, vec![payload]);
    }

    channel.sink.close().await.unwrap();
    assert_eq!(server.await.unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_large_message_crosses_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let mut channel = framed(stream, peer.to_string());
        channel.source.recv().await.unwrap().unwrap()
    });

    let mut channel = TcpConnector::default()
        .connect(&addr.to_string())
        .await
        .unwrap();
    let big = Bytes::from(vec![0xabu8; 512 * 1024]);
    channel
        .sink
        .send(ControlStreamMessage::notify(7, "Bulk", 1, vec![big.clone()]))
        .await
        .unwrap();

    let received = server.await.unwrap();
    assert_eq!(received.body.values[0], big);
}

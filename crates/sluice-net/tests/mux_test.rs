/// Integration tests: multiplexed request/response over loopback sockets.
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use sluice_net::{
    ConnectionKind, ConnectionTask, Endpoint, MuxConfig, MuxError, RequestCallback, Responder,
};

const DOUBLE: u32 = 10;
const SHOUT: u32 = 11;
const SILENT: u32 = 12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Number {
    value: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Text {
    value: String,
}

async fn tcp_endpoints(config: MuxConfig) -> (Endpoint, Endpoint) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client_task = ConnectionTask::open(ConnectionKind::Tcp);
    let (connected, accepted) = tokio::join!(client_task.connect(addr), listener.accept());
    connected.unwrap();
    let server_task = ConnectionTask::from_tcp(accepted.unwrap().0).unwrap();

    (
        Endpoint::new(Arc::new(client_task), config),
        Endpoint::new(Arc::new(server_task), config),
    )
}

fn short_timeout() -> MuxConfig {
    MuxConfig {
        request_timeout: Duration::from_millis(200),
    }
}

/// Records what a callback saw, tagged with what the caller expected.
struct Record<T> {
    expected: T,
    tx: mpsc::UnboundedSender<Result<(u32, u64, T, T), String>>,
}

impl<T: Send + 'static> RequestCallback<T> for Record<T> {
    fn on_success(self: Box<Self>, message_type: u32, correlation_id: u64, payload: T) {
        let _ = self
            .tx
            .send(Ok((message_type, correlation_id, payload, self.expected)));
    }

    fn on_fail(self: Box<Self>, error: MuxError) {
        let _ = self.tx.send(Err(error.to_string()));
    }
}

#[tokio::test]
async fn concurrent_requests_are_correlated() {
    let (a, b) = tcp_endpoints(MuxConfig::default()).await;
    let server = b.server();

    // Later requests are answered sooner, so replies arrive out of order.
    server.register_handler(DOUBLE, |req: Number, responder: Responder| async move {
        tokio::time::sleep(Duration::from_millis(100 - req.value * 5)).await;
        let _ = responder.reply(&Number { value: req.value * 2 }).await;
    });
    server.register_handler(SHOUT, |req: Text, responder: Responder| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = responder
            .reply(&Text {
                value: req.value.to_uppercase(),
            })
            .await;
    });

    let client = a.client();
    let (num_tx, mut num_rx) = mpsc::unbounded_channel();
    let (text_tx, mut text_rx) = mpsc::unbounded_channel();
    const N: u64 = 16;
    for i in 0..N {
        client.request(
            DOUBLE,
            &Number { value: i },
            Record {
                expected: Number { value: i * 2 },
                tx: num_tx.clone(),
            },
        );
        client.request(
            SHOUT,
            &Text {
                value: format!("msg-{}", i),
            },
            Record {
                expected: Text {
                    value: format!("MSG-{}", i),
                },
                tx: text_tx.clone(),
            },
        );
    }

    let mut ids = std::collections::HashSet::new();
    for _ in 0..N {
        let (ty, id, got, expected) = num_rx.recv().await.unwrap().unwrap();
        assert_eq!(ty, DOUBLE);
        assert_eq!(got, expected);
        assert!(ids.insert(id));

        let (ty, id, got, expected) = text_rx.recv().await.unwrap().unwrap();
        assert_eq!(ty, SHOUT);
        assert_eq!(got, expected);
        assert!(ids.insert(id));
    }
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn request_async_round_trip() {
    let (a, b) = tcp_endpoints(MuxConfig::default()).await;
    b.server()
        .register_handler(DOUBLE, |req: Number, responder: Responder| async move {
            let _ = responder.reply(&Number { value: req.value * 2 }).await;
        });

    let reply: Number = a
        .client()
        .request_async(DOUBLE, &Number { value: 21 })
        .await
        .unwrap();
    assert_eq!(reply.value, 42);
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let (a, b) = tcp_endpoints(short_timeout()).await;
    b.server()
        .register_handler(SILENT, |_req: Number, _responder: Responder| async move {});

    let client = a.client();
    let result: Result<Number, _> = client.request_async(SILENT, &Number { value: 1 }).await;
    assert!(matches!(result, Err(MuxError::Timeout)));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn missing_handler_fails_fast() {
    let (a, b) = tcp_endpoints(MuxConfig::default()).await;
    let _server = b.server();

    let started = std::time::Instant::now();
    let result: Result<Number, _> = a.client().request_async(DOUBLE, &Number { value: 1 }).await;
    match result {
        Err(MuxError::Remote(reason)) => assert!(reason.contains("no handler")),
        other => panic!("expected remote rejection, got {:?}", other),
    }
    assert!(started.elapsed() < MuxConfig::default().request_timeout);
}

#[tokio::test]
async fn malformed_payload_is_rejected() {
    let (a, b) = tcp_endpoints(MuxConfig::default()).await;
    b.server()
        .register_handler(DOUBLE, |req: Number, responder: Responder| async move {
            let _ = responder.reply(&req).await;
        });

    let result: Result<Number, _> = a
        .client()
        .request_async(DOUBLE, &Text { value: "nope".into() })
        .await;
    assert!(matches!(result, Err(MuxError::Remote(reason)) if reason.contains("malformed")));
}

#[tokio::test]
async fn registering_again_replaces_handler() {
    let (a, b) = tcp_endpoints(MuxConfig::default()).await;
    let server = b.server();
    server.register_handler(SHOUT, |_req: Text, responder: Responder| async move {
        let _ = responder.reply(&Text { value: "old".into() }).await;
    });
    server.register_handler(SHOUT, |_req: Text, responder: Responder| async move {
        let _ = responder.reply(&Text { value: "new".into() }).await;
    });

    let reply: Text = a
        .client()
        .request_async(SHOUT, &Text { value: String::new() })
        .await
        .unwrap();
    assert_eq!(reply.value, "new");

    server.clear_all();
    assert!(!server.has_handler(SHOUT));
}

#[tokio::test]
async fn unregistered_type_is_refused() {
    let (a, b) = tcp_endpoints(MuxConfig::default()).await;
    let server = b.server();
    server.register_handler(DOUBLE, |req: Number, responder: Responder| async move {
        let _ = responder.reply(&Number { value: req.value * 2 }).await;
    });
    let client = a.client();

    let reply: Number = client.request_async(DOUBLE, &Number { value: 4 }).await.unwrap();
    assert_eq!(reply.value, 8);

    assert!(server.unregister_handler(DOUBLE));
    assert!(!server.unregister_handler(DOUBLE));
    assert!(!server.has_handler(DOUBLE));

    let result: Result<Number, _> = client.request_async(DOUBLE, &Number { value: 4 }).await;
    match result {
        Err(MuxError::Remote(reason)) => assert!(reason.contains("no handler")),
        other => panic!("expected remote rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn disconnect_fails_pending_requests() {
    let (a, b) = tcp_endpoints(MuxConfig::default()).await;
    b.server()
        .register_handler(SILENT, |_req: Number, _responder: Responder| async move {});

    let client = a.client();
    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.request_async::<_, Number>(SILENT, &Number { value: 0 }).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    b.close("peer going away").await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(MuxError::Disconnected(_))));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn detaching_server_keeps_client_requests_alive() {
    let (a, b) = tcp_endpoints(MuxConfig::default()).await;

    // Both sides hold both roles.
    a.server()
        .register_handler(DOUBLE, |req: Number, responder: Responder| async move {
            let _ = responder.reply(&Number { value: req.value * 2 }).await;
        });
    b.server()
        .register_handler(DOUBLE, |req: Number, responder: Responder| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = responder.reply(&Number { value: req.value * 2 }).await;
        });

    let client = a.client();
    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.request_async::<_, Number>(DOUBLE, &Number { value: 4 }).await }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    a.detach_server();
    assert!(!a.has_server());
    assert!(a.has_client());

    assert_eq!(pending.await.unwrap().unwrap().value, 8);

    // b's request to a now has nobody to answer it.
    let result: Result<Number, _> = b.client().request_async(DOUBLE, &Number { value: 1 }).await;
    assert!(matches!(result, Err(MuxError::Remote(_))));
}

#[tokio::test]
async fn detaching_client_fails_its_requests() {
    let (a, b) = tcp_endpoints(MuxConfig::default()).await;
    b.server()
        .register_handler(SILENT, |_req: Number, _responder: Responder| async move {});

    let client = a.client();
    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.request_async::<_, Number>(SILENT, &Number { value: 0 }).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    a.detach_client();
    assert!(matches!(pending.await.unwrap(), Err(MuxError::Disconnected(_))));
    assert!(b.has_server());
}

#[tokio::test]
async fn multiplexes_over_udp() {
    let server_task = ConnectionTask::open(ConnectionKind::Udp);
    let addr = server_task.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let client_task = ConnectionTask::open(ConnectionKind::Udp);
    client_task.connect(addr).await.unwrap();

    let b = Endpoint::new(Arc::new(server_task), MuxConfig::default());
    b.server()
        .register_handler(DOUBLE, |req: Number, responder: Responder| async move {
            let _ = responder.reply(&Number { value: req.value * 2 }).await;
        });
    let a = Endpoint::new(Arc::new(client_task), MuxConfig::default());

    let reply: Number = a
        .client()
        .request_async(DOUBLE, &Number { value: 5 })
        .await
        .unwrap();
    assert_eq!(reply.value, 10);
}

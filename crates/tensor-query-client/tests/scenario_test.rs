// End-to-end tests: a real client against a real server on loopback.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use tensor_query_client::{ClientConfig, QueryClient};
use tensor_query_common::{
    CloseReason, DataInfo, Decision, Endpoint, NegotiationState, Protocol, QueryError,
    TensorBuffer, TensorInfo, TensorLayout, TensorType,
};
use tensor_query_server::{
    AcceptAll, DenyAll, QueryServer, ReceivedBuffer, ServerSession, SessionEvent, StreamPolicy,
};

const TIMEOUT: Duration = Duration::from_secs(2);

fn layout(tensor_type: TensorType, dims: &[u32]) -> TensorLayout {
    TensorLayout::single(TensorInfo::new(tensor_type, dims.to_vec()))
}

async fn serve<P: StreamPolicy>(
    protocol: Protocol,
    policy: P,
) -> (Arc<QueryServer>, mpsc::Receiver<ReceivedBuffer>) {
    let server = Arc::new(QueryServer::init());
    server.setup(protocol, "127.0.0.1", 0).await.unwrap();

    let (sink, buffers) = mpsc::channel(64);
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(policy, sink).await });
    (server, buffers)
}

fn client_for(server: &QueryServer, protocol: Protocol) -> QueryClient {
    QueryClient::new(
        ClientConfig::new(Endpoint::new(protocol, "127.0.0.1", server.current_port()))
            .with_connect_timeout(TIMEOUT)
            .with_io_timeout(TIMEOUT),
    )
}

#[tokio::test]
async fn test_tcp_happy_path() {
    let (server, mut buffers) = serve(Protocol::Tcp, AcceptAll).await;
    let mut session = client_for(&server, Protocol::Tcp).connect().await.unwrap();

    let info = DataInfo::new(layout(TensorType::Float32, &[1, 1, 1, 4]))
        .with_base_time(-5)
        .with_sent_time(1_000)
        .with_duration(33)
        .with_timestamps(7, 8);
    let payload: Vec<u8> = (0..16).collect();

    let decision = session
        .push(TensorBuffer::new(info.clone(), payload.clone()))
        .await
        .unwrap();
    assert_eq!(decision, Decision::Approve);

    let received = tokio::time::timeout(TIMEOUT, buffers.recv()).await.unwrap().unwrap();
    assert_eq!(received.buffer.info, info);
    assert_eq!(received.buffer.data.as_ref(), payload.as_slice());

    let stats = session.stats();
    assert_eq!(stats.commands_sent, 3);
    assert_eq!(stats.bytes_sent, 16);
    assert_eq!(stats.commands_received, 1);

    session.close().await.unwrap();
    server.free().await.unwrap();
}

#[tokio::test]
async fn test_deny_closes_connection() {
    let (server, mut buffers) = serve(Protocol::Tcp, DenyAll).await;
    let mut session = client_for(&server, Protocol::Tcp).connect().await.unwrap();

    let info = DataInfo::new(layout(TensorType::UInt8, &[4]));
    assert_eq!(session.start(info).await.unwrap(), Decision::Deny);
    assert!(!session.is_open());

    let result = session.send_data(vec![0u8; 4]).await;
    assert!(matches!(result, Err(QueryError::ConnectionClosed)));
    assert_eq!(session.stats().bytes_sent, 0);

    let nothing = tokio::time::timeout(Duration::from_millis(100), buffers.recv()).await;
    assert!(nothing.is_err(), "no buffer may arrive after a denial");
}

#[tokio::test]
async fn test_two_clients_do_not_interleave() {
    for protocol in [Protocol::Tcp, Protocol::Udp] {
        let (server, mut buffers) = serve(protocol, AcceptAll).await;
        // Larger than one datagram, so UDP streams are chunked too.
        let size = 100_000u32;

        let mut tasks = Vec::new();
        for fill in [1u8, 2u8] {
            let client = client_for(&server, protocol);
            tasks.push(tokio::spawn(async move {
                let mut session = client.connect().await.unwrap();
                for _ in 0..3 {
                    let info = DataInfo::new(layout(TensorType::UInt8, &[size]));
                    let buffer = TensorBuffer::new(info, vec![fill; size as usize]);
                    assert_eq!(session.push(buffer).await.unwrap(), Decision::Approve);
                }
                session
            }));
        }
        let mut sessions = Vec::new();
        for task in tasks {
            sessions.push(task.await.unwrap());
        }

        let mut counts = std::collections::HashMap::new();
        for _ in 0..6 {
            let received = tokio::time::timeout(TIMEOUT, buffers.recv()).await.unwrap().unwrap();
            assert_eq!(received.buffer.len(), size as usize);
            let fill = received.buffer.data[0];
            assert!(received.buffer.data.iter().all(|b| *b == fill));
            *counts.entry((received.connection, fill)).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 2);
        assert!(counts.values().all(|n| *n == 3));

        server.free().await.unwrap();
    }
}

#[tokio::test]
async fn test_single_tensor_stream_closes_both_machines() {
    let server = Arc::new(QueryServer::init());
    server.setup(Protocol::Tcp, "127.0.0.1", 0).await.unwrap();
    let accepting = {
        let server = server.clone();
        tokio::spawn(async move { server.accept(Some(TIMEOUT)).await })
    };
    let mut session = client_for(&server, Protocol::Tcp).connect().await.unwrap();
    let connection = accepting.await.unwrap().unwrap();
    let mut receiver = ServerSession::new(connection, Arc::new(AcceptAll), TIMEOUT);

    let info = DataInfo::new(layout(TensorType::Float32, &[1, 1, 1, 1]));
    let buffer = TensorBuffer::new(info.clone(), 1.5f32.to_be_bytes().to_vec());
    let pushing = tokio::spawn(async move {
        let decision = session.push(buffer).await;
        (session, decision)
    });

    match receiver.next_event().await.unwrap() {
        SessionEvent::Negotiated { info: got, decision } => {
            assert_eq!(got, info);
            assert_eq!(decision, Decision::Approve);
        }
        other => panic!("unexpected event {:?}", other),
    }
    match receiver.next_event().await.unwrap() {
        SessionEvent::Buffers(buffers) => {
            assert_eq!(buffers.len(), 1);
            assert_eq!(buffers[0].data.as_ref(), &1.5f32.to_be_bytes());
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(receiver.next_event().await.unwrap(), SessionEvent::Ended);
    assert_eq!(receiver.state(), NegotiationState::Closed(CloseReason::Ended));

    let (session, decision) = pushing.await.unwrap();
    assert_eq!(decision.unwrap(), Decision::Approve);
    assert_eq!(session.state(), NegotiationState::Closed(CloseReason::Ended));
    assert!(session.is_open());
    server.free().await.unwrap();
}

#[tokio::test]
async fn test_connect_timeout_is_bounded() {
    // A listener that completes the TCP handshake but never speaks, so the
    // broker acknowledgment never arrives.
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();
    let client = QueryClient::new(
        ClientConfig::new(Endpoint::mqtt("127.0.0.1", port))
            .with_connect_timeout(Duration::from_millis(100)),
    );

    let started = Instant::now();
    let result = client.connect().await;
    let elapsed = started.elapsed();

    assert!(
        matches!(result, Err(QueryError::Timeout(100))),
        "unexpected result: {:?}",
        result.err()
    );
    assert!(elapsed <= Duration::from_millis(150), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_tcp_connect_timeout_is_bounded() {
    // Non-routable address: the attempt hangs until the bound or is rejected
    // at once. Networks that proxy every address let it through.
    let client = QueryClient::new(
        ClientConfig::new(Endpoint::tcp("10.255.255.1", 4953))
            .with_connect_timeout(Duration::from_millis(100)),
    );

    let started = Instant::now();
    let result = client.connect().await;
    let elapsed = started.elapsed();

    match result {
        Ok(_) => eprintln!("10.255.255.1 is reachable here, nothing to check"),
        Err(e) => {
            assert!(
                matches!(e, QueryError::Timeout(100) | QueryError::Refused(_)),
                "unexpected error: {:?}",
                e
            );
            assert!(elapsed <= Duration::from_millis(150), "took {:?}", elapsed);
        }
    }
}

#[tokio::test]
async fn test_connect_refused() {
    let server = QueryServer::init();
    server.setup(Protocol::Tcp, "127.0.0.1", 0).await.unwrap();
    let port = server.current_port();
    server.free().await.unwrap();

    let client = QueryClient::new(ClientConfig::new(Endpoint::tcp("127.0.0.1", port)));
    let result = client.connect().await;
    assert!(matches!(result, Err(QueryError::Refused(_))));
}

#[tokio::test]
async fn test_server_free_ends_client_stream() {
    let (server, _buffers) = serve(Protocol::Tcp, AcceptAll).await;
    let mut session = client_for(&server, Protocol::Tcp).connect().await.unwrap();

    let info = DataInfo::new(layout(TensorType::UInt8, &[8]));
    assert_eq!(session.start(info).await.unwrap(), Decision::Approve);
    server.free().await.unwrap();

    // The server side is gone; the stream fails within a few sends and then stays closed.
    let mut failed = false;
    for _ in 0..50 {
        if session.send_data(vec![0u8; 8]).await.is_err() {
            failed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(failed);
    assert!(matches!(session.state(), NegotiationState::Closed(_)));
}

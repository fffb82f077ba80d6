use spacepark::allocator::{DockAllocator, ManualClock, MILLIS_PER_HOUR};
use spacepark::client::{ClientError, DockClient, FeeReply};
use spacepark::config::ServerConfig;
use spacepark::ledger::{LedgerStore, NewShip, PadId, SqliteLedger};
use spacepark::protocol::*;
use spacepark::server::{bind_in_range, DockServer, ServerError, ServerStats, StatsSnapshot};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const START: i64 = 1_700_000_000_000;

struct TestServer {
    addr: SocketAddr,
    stats: Arc<ServerStats>,
    clock: ManualClock,
    allocator: Arc<DockAllocator<SqliteLedger>>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        self.task.await.unwrap().unwrap();
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        port_range_end: Some(0),
        ..ServerConfig::default()
    }
}

/// Serves a ledger built by `seed` on an ephemeral port.
async fn start_server(config: ServerConfig, seed: impl FnOnce(&SqliteLedger)) -> TestServer {
    let ledger = SqliteLedger::open_in_memory().unwrap();
    seed(&ledger);

    let clock = ManualClock::new(START);
    let allocator = Arc::new(DockAllocator::with_clock(ledger, Arc::new(clock.clone())));
    let server = DockServer::bind(&config, Arc::clone(&allocator)).await.unwrap();
    let addr = server.local_addr().unwrap();
    let stats = server.stats();

    let (shutdown, signal) = oneshot::channel();
    let task = tokio::spawn(server.serve_until(async move {
        let _ = signal.await;
    }));

    TestServer {
        addr,
        stats,
        clock,
        allocator,
        shutdown,
        task,
    }
}

/// One pad able to take ships under 50, billed 15/h and 50/day.
fn one_pad(ledger: &SqliteLedger) {
    let terminal = ledger.add_terminal("Alpha").unwrap();
    ledger.add_pad(terminal, 50.0, 15, 50).unwrap();
}

async fn wait_for(stats: &ServerStats, condition: impl Fn(&StatsSnapshot) -> bool) {
    for _ in 0..300 {
        if condition(&stats.snapshot()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never reached: {:?}", stats.snapshot());
}

/// True once the peer has closed or reset the connection.
async fn closed_by_peer(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        Ok(Ok(_)) | Err(_) => false,
    }
}

#[tokio::test]
async fn test_query_returns_lowest_free_fitting_pad() {
    let server = start_server(test_config(), |ledger| {
        let terminal = ledger.add_terminal("Alpha").unwrap();
        let taken = ledger.add_pad(terminal, 30.0, 15, 50).unwrap();
        ledger.add_pad(terminal, 20.0, 15, 50).unwrap();
        ledger
            .insert_ship_if_vacant(&NewShip {
                pad_id: taken,
                license: "RESIDENT".into(),
                weight: 5.0,
                docked_at: 0,
            })
            .unwrap();
    })
    .await;
    let free_pad: PadId = server.allocator.store().pads().unwrap()[1].id;

    let mut client = DockClient::connect(server.addr).await.unwrap();
    assert_eq!(client.query(10.0).await.unwrap(), Some(free_pad));
    assert_eq!(client.query(25.0).await.unwrap(), None);
    assert!(client.session().is_some_and(|id| id != 0));

    server.stop().await;
}

#[tokio::test]
async fn test_dock_then_undock_bills_elapsed_time() {
    let server = start_server(test_config(), one_pad).await;
    let pad = server.allocator.store().pads().unwrap()[0].id;

    let mut client = DockClient::connect(server.addr).await.unwrap();
    assert_eq!(client.dock(pad, 10.0, "NCC-1701").await.unwrap(), Status::Ok);
    assert_eq!(client.dock(pad, 10.0, "NCC-1702").await.unwrap(), Status::Occupied);
    assert_eq!(client.query(10.0).await.unwrap(), None);

    server.clock.advance(MILLIS_PER_HOUR);
    assert_eq!(
        client.fee(pad).await.unwrap(),
        FeeReply {
            status: Status::Ok,
            fee: Some(15)
        }
    );
    assert_eq!(
        client.undock(pad).await.unwrap(),
        FeeReply {
            status: Status::Ok,
            fee: Some(15)
        }
    );
    assert_eq!(
        client.undock(pad).await.unwrap(),
        FeeReply {
            status: Status::NotDocked,
            fee: None
        }
    );
    assert!(server.allocator.store().occupant(pad).unwrap().is_none());

    wait_for(&server.stats, |s| s.requests == 6).await;
    server.stop().await;
}

#[tokio::test]
async fn test_overweight_request_over_the_wire() {
    let server = start_server(test_config(), one_pad).await;
    let pad = server.allocator.store().pads().unwrap()[0].id;

    let mut client = DockClient::connect(server.addr).await.unwrap();
    assert_eq!(client.dock(pad, 999.0, "TANKER").await.unwrap(), Status::Overweight);
    assert_eq!(client.query(10.0).await.unwrap(), Some(pad));

    server.stop().await;
}

#[tokio::test]
async fn test_split_frame_is_reassembled() {
    let server = start_server(test_config(), one_pad).await;
    let pad = server.allocator.store().pads().unwrap()[0].id;

    let request = Frame::new(
        99,
        0,
        Message::DockRequest {
            dock_id: pad,
            weight: 3.0,
            license: license_from_str("PIECEMEAL"),
        },
    )
    .encode();

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    for piece in request.chunks(7) {
        stream.write_all(piece).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut reply = [0u8; DOCK_RESPONSE_LEN];
    stream.read_exact(&mut reply).await.unwrap();
    let response = Frame::decode(&reply).unwrap();
    assert_eq!(response.sequence, 99);
    assert_eq!(response.message, Message::DockResponse { status: Status::Ok });

    server.stop().await;
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let server = start_server(test_config(), one_pad).await;
    let pad = server.allocator.store().pads().unwrap()[0].id;

    let mut batch = Frame::new(1, 0, Message::DockQuery { weight: 1.0 }).encode();
    batch.extend(Frame::new(2, 0, Message::FeeQuery { dock_id: pad }).encode());

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(&batch).await.unwrap();

    let mut reply = [0u8; DOCK_QUERY_RESPONSE_LEN + FEE_RESPONSE_LEN];
    stream.read_exact(&mut reply).await.unwrap();

    let first = Frame::decode(&reply[..DOCK_QUERY_RESPONSE_LEN]).unwrap();
    let second = Frame::decode(&reply[DOCK_QUERY_RESPONSE_LEN..]).unwrap();
    assert_eq!(first.sequence, 1);
    assert_eq!(first.message, Message::DockQueryResponse { dock_id: pad });
    assert_eq!(second.sequence, 2);
    assert_eq!(
        second.message,
        Message::FeeResponse {
            status: Status::NotDocked,
            fee: NO_FEE
        }
    );
    assert_eq!(first.session, second.session);

    server.stop().await;
}

#[tokio::test]
async fn test_protocol_error_closes_connection() {
    let server = start_server(test_config(), one_pad).await;

    let mut bytes = Frame::new(1, 0, Message::DockQuery { weight: 1.0 }).encode();
    bytes[12..14].copy_from_slice(&99u16.to_be_bytes());

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(&bytes).await.unwrap();

    assert!(closed_by_peer(&mut stream).await);
    wait_for(&server.stats, |s| s.protocol_errors == 1 && s.active == 0).await;

    // Other clients are unaffected.
    let mut client = DockClient::connect(server.addr).await.unwrap();
    assert!(client.query(1.0).await.unwrap().is_some());

    server.stop().await;
}

#[tokio::test]
async fn test_response_type_from_client_closes_connection() {
    let server = start_server(test_config(), one_pad).await;

    let mut client = DockClient::connect(server.addr).await.unwrap();
    let err = client
        .request(Message::DockResponse { status: Status::Ok })
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::ConnectionClosed | ClientError::Io(_)));

    wait_for(&server.stats, |s| s.protocol_errors == 1).await;
    server.stop().await;
}

#[tokio::test]
async fn test_full_table_rejects_then_recovers() {
    let config = ServerConfig {
        max_clients: 1,
        ..test_config()
    };
    let server = start_server(config, one_pad).await;

    let mut first = DockClient::connect(server.addr).await.unwrap();
    assert!(first.query(1.0).await.unwrap().is_some());

    let mut second = TcpStream::connect(server.addr).await.unwrap();
    assert!(closed_by_peer(&mut second).await);
    wait_for(&server.stats, |s| s.rejected == 1).await;

    drop(first);
    wait_for(&server.stats, |s| s.active == 0).await;

    let mut third = DockClient::connect(server.addr).await.unwrap();
    assert!(third.query(1.0).await.unwrap().is_some());
    assert_eq!(server.stats.snapshot().accepted, 2);

    server.stop().await;
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let config = ServerConfig {
        idle_timeout_secs: Some(1),
        ..test_config()
    };
    let server = start_server(config, one_pad).await;

    let mut silent = TcpStream::connect(server.addr).await.unwrap();
    assert!(closed_by_peer(&mut silent).await);
    wait_for(&server.stats, |s| s.active == 0).await;
    assert_eq!(server.stats.snapshot().protocol_errors, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_open_connections() {
    let server = start_server(test_config(), one_pad).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    wait_for(&server.stats, |s| s.active == 1).await;

    server.stop().await;
    assert!(closed_by_peer(&mut stream).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_network_docks_have_single_winner() {
    const CONTENDERS: usize = 8;

    let server = start_server(test_config(), one_pad).await;
    let pad = server.allocator.store().pads().unwrap()[0].id;

    let mut clients = Vec::with_capacity(CONTENDERS);
    for _ in 0..CONTENDERS {
        clients.push(DockClient::connect(server.addr).await.unwrap());
    }

    let attempts: Vec<_> = clients
        .into_iter()
        .enumerate()
        .map(|(i, mut client)| {
            tokio::spawn(async move { client.dock(pad, 10.0, &format!("RACER-{}", i)).await })
        })
        .collect();

    let mut statuses = Vec::with_capacity(CONTENDERS);
    for attempt in attempts {
        statuses.push(attempt.await.unwrap().unwrap());
    }

    assert_eq!(statuses.iter().filter(|s| **s == Status::Ok).count(), 1);
    assert_eq!(
        statuses.iter().filter(|s| **s == Status::Occupied).count(),
        CONTENDERS - 1
    );
    assert_eq!(server.allocator.store().ships().unwrap().len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_bind_in_range_skips_taken_port() {
    let taken = bind_in_range("127.0.0.1", 0, 0).await.unwrap();
    let port = taken.local_addr().unwrap().port();

    match bind_in_range("127.0.0.1", port, port).await {
        Err(ServerError::NoPortAvailable { first, last, .. }) => {
            assert_eq!((first, last), (port, port));
        }
        other => panic!("Expected NoPortAvailable, got {:?}", other.map(|l| l.local_addr())),
    }

    let last = port.saturating_add(20);
    if last > port {
        let next = bind_in_range("127.0.0.1", port, last).await.unwrap();
        let bound = next.local_addr().unwrap().port();
        assert!(bound > port && bound <= last);
    }
}

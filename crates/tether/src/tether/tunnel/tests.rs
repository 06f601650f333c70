use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::tether::tunnel::{
    client::{Client, ClientError, ClientOptions},
    protocol::{self, Envelope},
    routes::{RouteTable, SharedRoutes},
    server::{Server, ServerOptions},
};

const TOKEN: &str = "foobar";
const WAIT: Duration = Duration::from_secs(5);

struct RunningServer {
    control: String,
    external: String,
    routes: SharedRoutes,
    _shutdown: watch::Sender<bool>,
}

async fn start_server() -> RunningServer {
    start_server_with(Duration::from_secs(5)).await
}

async fn start_server_with(handshake_timeout: Duration) -> RunningServer {
    let routes: SharedRoutes = Arc::new(RouteTable::new());
    let server = Server::bind(ServerOptions {
        control_addr: "127.0.0.1:0".into(),
        external_addr: "127.0.0.1:0".into(),
        transport: "tcp".into(),
        auth_token: TOKEN.into(),
        handshake_timeout,
        queue_capacity: 64,
        buffer_size: 1024,
        routes: routes.clone(),
    })
    .await
    .expect("bind server");

    let control = server.control_addr().expect("control addr").to_string();
    let external = server.external_addr().expect("external addr").to_string();
    let (tx, rx) = watch::channel(false);
    tokio::spawn(server.serve(rx));

    RunningServer {
        control,
        external,
        routes,
        _shutdown: tx,
    }
}

struct RunningClient {
    routes: SharedRoutes,
    handle: JoinHandle<Result<(), ClientError>>,
    _shutdown: watch::Sender<bool>,
}

fn start_client(server_addr: &str, local_addr: &str, token: &str) -> RunningClient {
    let routes: SharedRoutes = Arc::new(RouteTable::new());
    let client = Client::new(ClientOptions {
        server_addr: server_addr.into(),
        local_addr: local_addr.into(),
        transport: "tcp".into(),
        auth_token: token.into(),
        dial_timeout: Duration::from_secs(2),
        queue_capacity: 64,
        buffer_size: 1024,
        routes: routes.clone(),
    })
    .expect("client options");

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { client.run(rx).await });
    RunningClient {
        routes,
        handle,
        _shutdown: tx,
    }
}

/// Local service that writes back everything it reads.
async fn start_echo_service() -> String {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ln.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut c, _)) = ln.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = c.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// Local service that reports each connection's first read, then hangs up.
async fn start_one_shot_service() -> (String, mpsc::UnboundedReceiver<Vec<u8>>) {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ln.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut c, _)) = ln.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1024];
                if let Ok(n) = c.read(&mut buf).await {
                    let _ = tx.send(buf[..n].to_vec());
                }
            });
        }
    });
    (addr, rx)
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn read_exactly(c: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(WAIT, c.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .expect("read");
    buf
}

async fn expect_eof(c: &mut TcpStream) -> Vec<u8> {
    let mut rest = Vec::new();
    tokio::time::timeout(WAIT, c.read_to_end(&mut rest))
        .await
        .expect("eof timed out")
        .expect("read to end");
    rest
}

/// Authenticated raw control connection standing in for the client.
async fn fake_client(control: &str) -> TcpStream {
    let mut s = TcpStream::connect(control).await.unwrap();
    protocol::initiate_auth(&mut s, TOKEN).await.expect("handshake");
    s
}

async fn next_envelope(s: &mut TcpStream) -> Envelope {
    tokio::time::timeout(WAIT, protocol::read_envelope(s))
        .await
        .expect("envelope timed out")
        .expect("envelope")
}

#[tokio::test]
async fn request_reaches_local_service_and_response_returns() {
    let local = start_echo_service().await;
    let server = start_server().await;
    let _client = start_client(&server.control, &local, TOKEN);

    let mut ext = TcpStream::connect(&server.external).await.unwrap();
    ext.write_all(b"GET / \r\n").await.unwrap();
    assert_eq!(read_exactly(&mut ext, 8).await, b"GET / \r\n");

    assert_eq!(server.routes.len(), 1);
}

#[tokio::test]
async fn concurrent_peers_do_not_see_each_other() {
    let local = start_echo_service().await;
    let server = start_server().await;
    let client = start_client(&server.control, &local, TOKEN);

    let mut a = TcpStream::connect(&server.external).await.unwrap();
    let mut b = TcpStream::connect(&server.external).await.unwrap();
    a.write_all(b"alpha").await.unwrap();
    b.write_all(b"bravo").await.unwrap();

    assert_eq!(read_exactly(&mut a, 5).await, b"alpha");
    assert_eq!(read_exactly(&mut b, 5).await, b"bravo");

    a.write_all(b"again").await.unwrap();
    assert_eq!(read_exactly(&mut a, 5).await, b"again");

    let client_routes = client.routes.clone();
    eventually("two local connections", || client_routes.len() == 2).await;
}

#[tokio::test]
async fn bytes_of_one_peer_arrive_in_order() {
    let local = start_echo_service().await;
    let server = start_server().await;
    let _client = start_client(&server.control, &local, TOKEN);

    let mut ext = TcpStream::connect(&server.external).await.unwrap();
    let mut expected = Vec::new();
    for i in 0..200 {
        let chunk = format!("chunk-{i};");
        ext.write_all(chunk.as_bytes()).await.unwrap();
        expected.extend_from_slice(chunk.as_bytes());
    }

    let got = read_exactly(&mut ext, expected.len()).await;
    assert_eq!(got, expected);
}

#[tokio::test]
async fn external_close_clears_both_routing_tables() {
    let local = start_echo_service().await;
    let server = start_server().await;
    let client = start_client(&server.control, &local, TOKEN);

    let mut ext = TcpStream::connect(&server.external).await.unwrap();
    ext.write_all(b"hi").await.unwrap();
    assert_eq!(read_exactly(&mut ext, 2).await, b"hi");
    drop(ext);

    let server_routes = server.routes.clone();
    eventually("server entry removed", || server_routes.is_empty()).await;
    let client_routes = client.routes.clone();
    eventually("client entry removed", || client_routes.is_empty()).await;
}

#[tokio::test]
async fn local_close_reaches_external_peer() {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = ln.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut c, _) = ln.accept().await.unwrap();
        let mut buf = [0u8; 2];
        c.read_exact(&mut buf).await.unwrap();
        c.write_all(b"bye").await.unwrap();
    });

    let server = start_server().await;
    let _client = start_client(&server.control, &local, TOKEN);

    let mut ext = TcpStream::connect(&server.external).await.unwrap();
    ext.write_all(b"hi").await.unwrap();
    assert_eq!(expect_eof(&mut ext).await, b"bye");

    let server_routes = server.routes.clone();
    eventually("server entry removed", || server_routes.is_empty()).await;
}

#[tokio::test]
async fn client_redials_after_local_service_hangs_up() {
    let (local, mut seen) = start_one_shot_service().await;
    let ctl = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ctl_addr = ctl.local_addr().unwrap().to_string();
    let client = start_client(&ctl_addr, &local, TOKEN);

    let (mut s, _) = ctl.accept().await.unwrap();
    protocol::accept_auth(&mut s, TOKEN).await.expect("handshake");

    protocol::write_envelope(&mut s, &Envelope::data("x#1", Bytes::from_static(b"one")))
        .await
        .unwrap();
    let first = tokio::time::timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(first, b"one");

    let notice = next_envelope(&mut s).await;
    assert_eq!(notice.identity, "x#1");
    assert!(notice.is_close());
    let client_routes = client.routes.clone();
    eventually("client entry removed", || client_routes.is_empty()).await;

    protocol::write_envelope(&mut s, &Envelope::data("x#1", Bytes::from_static(b"two")))
        .await
        .unwrap();
    let second = tokio::time::timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(second, b"two");
}

#[tokio::test]
async fn close_notice_from_server_closes_local_connection() {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = ln.local_addr().unwrap().to_string();
    let ctl = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ctl_addr = ctl.local_addr().unwrap().to_string();
    let client = start_client(&ctl_addr, &local, TOKEN);

    let (mut s, _) = ctl.accept().await.unwrap();
    protocol::accept_auth(&mut s, TOKEN).await.expect("handshake");
    protocol::write_envelope(&mut s, &Envelope::data("y#7", Bytes::from_static(b"req")))
        .await
        .unwrap();

    let (mut svc, _) = tokio::time::timeout(WAIT, ln.accept()).await.unwrap().unwrap();
    let mut buf = [0u8; 3];
    svc.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"req");

    protocol::write_envelope(&mut s, &Envelope::close("y#7")).await.unwrap();
    assert!(expect_eof(&mut svc).await.is_empty());

    let client_routes = client.routes.clone();
    eventually("client entry removed", || client_routes.is_empty()).await;
}

#[tokio::test]
async fn wrong_token_fails_the_client_and_delivers_nothing() {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = ln.local_addr().unwrap().to_string();
    let server = start_server().await;
    let client = start_client(&server.control, &local, "not-the-token");

    let mut ext = TcpStream::connect(&server.external).await.unwrap();
    ext.write_all(b"secret").await.unwrap();

    let res = tokio::time::timeout(WAIT, client.handle)
        .await
        .expect("client finished")
        .expect("join");
    assert!(matches!(res, Err(ClientError::Handshake { .. })), "{res:?}");

    let accepted = tokio::time::timeout(Duration::from_millis(300), ln.accept()).await;
    assert!(accepted.is_err(), "local service must not be contacted");
}

#[tokio::test]
async fn silent_control_connection_is_dropped_after_handshake_timeout() {
    let server = start_server_with(Duration::from_millis(200)).await;
    let mut s = TcpStream::connect(&server.control).await.unwrap();
    assert!(expect_eof(&mut s).await.is_empty());
}

#[tokio::test]
async fn lost_control_link_ends_the_session() {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = ln.local_addr().unwrap().to_string();
    let ctl = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ctl_addr = ctl.local_addr().unwrap().to_string();
    let client = start_client(&ctl_addr, &local, TOKEN);

    let (mut s, _) = ctl.accept().await.unwrap();
    protocol::accept_auth(&mut s, TOKEN).await.expect("handshake");
    protocol::write_envelope(&mut s, &Envelope::data("z#1", Bytes::from_static(b"hello")))
        .await
        .unwrap();
    let (mut svc, _) = tokio::time::timeout(WAIT, ln.accept()).await.unwrap().unwrap();
    let mut buf = [0u8; 5];
    svc.read_exact(&mut buf).await.unwrap();
    drop(s);

    // The session ends without a re-dial and takes its local connections with it.
    let res = tokio::time::timeout(WAIT, client.handle)
        .await
        .expect("session ended")
        .expect("join");
    assert!(matches!(res, Err(ClientError::LinkClosed(_))), "{res:?}");
    assert!(client.routes.is_empty());
    assert!(expect_eof(&mut svc).await.is_empty());
    let redial = tokio::time::timeout(Duration::from_millis(300), ctl.accept()).await;
    assert!(redial.is_err(), "client must not re-dial");
}

#[tokio::test]
async fn local_dial_failure_drops_only_that_envelope() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = unused.local_addr().unwrap();
    drop(unused);

    let ctl = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ctl_addr = ctl.local_addr().unwrap().to_string();
    let client = start_client(&ctl_addr, &local.to_string(), TOKEN);

    let (mut s, _) = ctl.accept().await.unwrap();
    protocol::accept_auth(&mut s, TOKEN).await.expect("handshake");
    protocol::write_envelope(&mut s, &Envelope::data("x#1", Bytes::from_static(b"first")))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(client.routes.is_empty());

    let svc = TcpListener::bind(local).await.unwrap();
    protocol::write_envelope(&mut s, &Envelope::data("x#1", Bytes::from_static(b"second")))
        .await
        .unwrap();

    let (mut c, _) = tokio::time::timeout(WAIT, svc.accept()).await.unwrap().unwrap();
    let mut buf = [0u8; 6];
    tokio::time::timeout(WAIT, c.read_exact(&mut buf))
        .await
        .expect("payload")
        .unwrap();
    assert_eq!(&buf, b"second");
    let client_routes = client.routes.clone();
    eventually("fresh local connection routed", || client_routes.len() == 1).await;

    let extra = tokio::time::timeout(Duration::from_millis(300), svc.accept()).await;
    assert!(extra.is_err(), "the dropped envelope must not be replayed");
    let mut more = [0u8; 1];
    let leftover = tokio::time::timeout(Duration::from_millis(200), c.read(&mut more)).await;
    assert!(leftover.is_err(), "only the second payload is delivered");
}

#[tokio::test]
async fn unroutable_envelope_does_not_block_later_ones() {
    let server = start_server().await;
    let mut ctl = fake_client(&server.control).await;

    let mut ext = TcpStream::connect(&server.external).await.unwrap();
    ext.write_all(b"ping").await.unwrap();
    let env = next_envelope(&mut ctl).await;
    assert_eq!(&env.payload[..], b"ping");

    protocol::write_envelope(&mut ctl, &Envelope::data("nobody#9", Bytes::from_static(b"zzz")))
        .await
        .unwrap();
    protocol::write_envelope(&mut ctl, &Envelope::data(env.identity, Bytes::from_static(b"pong")))
        .await
        .unwrap();

    assert_eq!(read_exactly(&mut ext, 4).await, b"pong");
}

#[tokio::test]
async fn new_control_link_replaces_the_old_one() {
    let server = start_server().await;
    let mut old = fake_client(&server.control).await;

    let mut ext_a = TcpStream::connect(&server.external).await.unwrap();
    ext_a.write_all(b"a").await.unwrap();
    let env = next_envelope(&mut old).await;
    assert_eq!(&env.payload[..], b"a");

    let mut new = fake_client(&server.control).await;

    // Peers carried by the old link are closed along with it.
    assert!(expect_eof(&mut ext_a).await.is_empty());
    let mut rest = Vec::new();
    let _ = tokio::time::timeout(WAIT, old.read_to_end(&mut rest))
        .await
        .expect("old link closed");

    let mut ext_b = TcpStream::connect(&server.external).await.unwrap();
    ext_b.write_all(b"b").await.unwrap();
    let env = next_envelope(&mut new).await;
    assert_eq!(&env.payload[..], b"b");

    protocol::write_envelope(&mut new, &Envelope::data(env.identity, Bytes::from_static(b"B")))
        .await
        .unwrap();
    assert_eq!(read_exactly(&mut ext_b, 1).await, b"B");
}

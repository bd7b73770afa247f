use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use exec_rpc::conetty::{TcpConnector, TcpEndpoint};
use exec_rpc::{
    AsyncExecutor, AsyncServer, Caller, EchoExecutor, Error, Server, ServerConfig,
    TransportErrorKind,
};

fn init() {
    let _ = env_logger::try_init();
}

fn any_port() -> TcpEndpoint {
    TcpEndpoint(SocketAddr::from(([127, 0, 0, 1], 0)))
}

fn echo_server() -> (Server, TcpConnector) {
    let server = Server::new(ServerConfig::default());
    server.listen(EchoExecutor::new(), any_port(), false).unwrap();
    let addr = server.local_addr().unwrap();
    (server, TcpConnector::new(addr).unwrap())
}

#[test]
fn tcp_echo() {
    init();
    let (server, connector) = echo_server();
    let caller = Caller::new(connector);
    caller.start().unwrap();

    for i in 0..10 {
        let s = format!("Hello World! id={i}");
        assert_eq!(caller.call("echo", s.as_bytes()).unwrap(), s.as_bytes());
    }
    assert_eq!(caller.get_executor_version().unwrap(), "1.0");

    let big = vec![7u8; 1024 * 1024];
    assert_eq!(caller.call("echo", &big).unwrap(), big);

    caller.stop();
    server.wait();
    assert!(!server.is_running());
}

#[test]
fn tcp_concurrent_calls() {
    init();
    let (server, connector) = echo_server();
    let caller = Arc::new(Caller::new(connector));
    caller.start().unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let caller = caller.clone();
            thread::spawn(move || {
                for j in 0..20 {
                    let s = format!("{i}-{j}");
                    assert_eq!(caller.call("echo", s.as_bytes()).unwrap(), s.as_bytes());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert!(server.stop(Some(Duration::from_secs(1))));
}

#[test]
fn tcp_streaming() {
    init();
    let (server, connector) = echo_server();
    let caller = Caller::new(connector);
    caller.start().unwrap();

    let stream = caller.call_streaming("upper", b"x".to_vec()).unwrap();
    for word in ["a", "b", "c"] {
        stream.write(word).unwrap();
    }
    stream.end_write();
    let chunks = stream.read_all().unwrap();
    assert_eq!(
        chunks,
        vec![b"upper:x".to_vec(), b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
    );

    // two streams on one connection don't mix
    let one = caller.call_streaming("one", b"".to_vec()).unwrap();
    let two = caller.call_streaming("two", b"".to_vec()).unwrap();
    two.write("2").unwrap();
    one.write("1").unwrap();
    one.end_write();
    two.end_write();
    assert_eq!(one.read_all().unwrap(), vec![b"one:".to_vec(), b"1".to_vec()]);
    assert_eq!(two.read_all().unwrap(), vec![b"two:".to_vec(), b"2".to_vec()]);

    assert!(server.stop(Some(Duration::from_secs(1))));
}

#[test]
fn tcp_reconnects_after_server_restart() {
    init();
    let (server, connector) = echo_server();
    let addr = connector.addr();
    let caller = Caller::new(connector);
    caller.start().unwrap();
    assert_eq!(caller.call("echo", b"before").unwrap(), b"before");

    // drops the live connection
    assert!(server.stop(Some(Duration::from_secs(1))));
    let server = Server::new(ServerConfig::default());
    server
        .listen(EchoExecutor::new(), TcpEndpoint(addr), false)
        .unwrap();

    assert_eq!(caller.call("echo", b"after").unwrap(), b"after");
    assert_eq!(caller.reconnect_count(), 1);
    assert!(server.stop(Some(Duration::from_secs(1))));
}

#[test]
fn tcp_peer_down_is_rpc_error() {
    init();
    let (server, connector) = echo_server();
    let caller = Caller::new(connector);
    caller.start().unwrap();
    assert!(server.stop(Some(Duration::from_secs(1))));

    match caller.call("echo", b"x") {
        Err(Error::Rpc { source, .. }) => assert!(source.is_transient()),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn tcp_async_executor() {
    init();
    let executor = AsyncExecutor::new().with_reply_timeout(Duration::from_secs(5));
    let server = AsyncServer::start_with(any_port(), executor, ServerConfig::default()).unwrap();
    let addr = server.server().local_addr().unwrap();
    let caller = Arc::new(Caller::new(TcpConnector::new(addr).unwrap()));
    caller.start().unwrap();

    let c = caller.clone();
    let h = thread::spawn(move || c.call("dummy_send", b"abc"));
    let call = loop {
        match server.get() {
            Ok(call) => break call,
            Err(_) => thread::sleep(Duration::from_millis(1)),
        }
    };
    assert_eq!(call.procedure_name(), "dummy_send");
    call.return_value(b"ok".to_vec()).unwrap();
    assert_eq!(h.join().unwrap().unwrap(), b"ok");

    let err = caller.call("_rpc_unknown", b"").unwrap_err();
    assert_eq!(err.transport().map(|e| e.kind()), Some(TransportErrorKind::Remote));
    assert!(server.stop(Some(Duration::from_secs(1))));
}

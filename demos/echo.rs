use exec_rpc::conetty::{TcpConnector, TcpEndpoint};
use exec_rpc::{Caller, EchoExecutor, Server, ServerConfig};

fn main() {
    env_logger::init();

    let addr = "127.0.0.1:4000".parse().unwrap();
    let server = Server::new(ServerConfig::default());
    server
        .listen(EchoExecutor::new(), TcpEndpoint(addr), false)
        .unwrap();

    let caller = Caller::new(TcpConnector::new(addr).unwrap());
    caller.start().unwrap();
    println!("executor version = {}", caller.get_executor_version().unwrap());
    println!("device time = {}us", caller.device_time_usec().unwrap());

    for i in 0..10 {
        let s = format!("Hello World! id={i}");
        let data = caller.call("echo", s).unwrap();
        println!("recv = {:?}", String::from_utf8_lossy(&data));
    }

    let stream = caller.call_streaming("upper", b"demo".to_vec()).unwrap();
    for word in ["one", "two", "three"] {
        stream.write(word).unwrap();
    }
    stream.end_write();
    while let Some(chunk) = stream.read().unwrap() {
        println!("stream recv = {:?}", String::from_utf8_lossy(&chunk));
    }

    // asks the server to shut down
    caller.stop();
    server.wait();
    println!("server stopped: {}", !server.is_running());
}

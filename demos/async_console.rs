//! answer parked calls by hand
//!
//! a background caller sends a few calls, the console shows every waiting call and replies to
//! them newest first, so the log ends up in reverse arrival order
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use exec_rpc::{loopback, AsyncServer, Caller};

fn main() {
    env_logger::init();

    let (endpoint, connector) = loopback::pair();
    let server = AsyncServer::start(endpoint).unwrap();
    let caller = Arc::new(Caller::new(connector));
    caller.start().unwrap();

    let handles: Vec<_> = ["first", "second", "third"]
        .into_iter()
        .map(|params| {
            let caller = caller.clone();
            thread::spawn(move || caller.call("dummy_send", params).unwrap())
        })
        .collect();

    while server.waiting_calls().len() < handles.len() {
        thread::sleep(Duration::from_millis(1));
    }

    for call in server.waiting_calls().iter().rev() {
        println!("{call}\n");
        let reply = format!("ack {}", call.index());
        call.return_value(reply).unwrap();
    }

    for h in handles {
        println!("caller got {:?}", String::from_utf8_lossy(&h.join().unwrap()));
    }
    for call in server.logged_calls() {
        println!("logged {call:?}");
    }

    println!("stopped cleanly: {}", server.stop(Some(Duration::from_secs(1))));
}

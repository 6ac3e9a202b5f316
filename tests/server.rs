//! End-to-end tests against real sockets.
//!
//! The server runs on the crate's global executor; clients are plain
//! blocking sockets on the test thread.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tern::{
    block_on, spawn, Message, MessageStream, Response, Server, ServerError, SocketAddress, Task,
    Unhandled,
};

fn start_server(server: &Arc<Server>) -> (SocketAddr, Task<Result<(), ServerError>>) {
    let task = spawn({
        let server = server.clone();
        async move { server.start().await }
    });
    let address = block_on(server.wait_until_listening()).unwrap();
    match address {
        SocketAddress::Inet(addr) => (addr, task),
        other => panic!("expected an inet address, got {}", other),
    }
}

/// Sends one request with `Connection: close` and returns the raw response.
fn roundtrip(addr: &SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(request.as_bytes()).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

async fn sleep(duration: Duration) {
    blocking::unblock(move || std::thread::sleep(duration)).await
}

#[test]
fn empty_route_table_responds_404() {
    let server = Arc::new(Server::bind("127.0.0.1:0").unwrap());
    let (addr, task) = start_server(&server);

    let response = roundtrip(&addr, "GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));

    block_on(server.stop());
    block_on(task).unwrap();
}

#[test]
fn appended_route_serves_its_body() {
    let server = Arc::new(Server::bind("127.0.0.1:0").unwrap());
    let (addr, task) = start_server(&server);

    // Appending after start is supported.
    server
        .route("GET /hello", |_req: tern::Request| async move {
            Ok::<_, Unhandled>(Response::text("hi"))
        })
        .unwrap();

    let response = roundtrip(
        &addr,
        "GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Length: 2\r\n"));
    assert!(response.ends_with("\r\n\r\nhi"));

    block_on(server.stop());
    block_on(task).unwrap();
}

#[test]
fn keep_alive_serves_pipelined_requests_in_order() {
    let server = Arc::new(Server::bind("127.0.0.1:0").unwrap());
    let (addr, task) = start_server(&server);
    server
        .route("GET /one", |_req: tern::Request| async move {
            Ok::<_, Unhandled>(Response::text("first"))
        })
        .unwrap();
    server
        .route("GET /two", |_req: tern::Request| async move {
            Ok::<_, Unhandled>(Response::text("second"))
        })
        .unwrap();

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .write_all(
            b"GET /one HTTP/1.1\r\nHost: x\r\n\r\n\
              GET /two HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    let first = response.find("first").unwrap();
    let second = response.find("second").unwrap();
    assert!(first < second);

    block_on(server.stop());
    block_on(task).unwrap();
}

#[test]
fn chunked_request_bodies_are_decoded() {
    let server = Arc::new(Server::bind("127.0.0.1:0").unwrap());
    let (addr, task) = start_server(&server);
    server
        .route("POST /echo", |req: tern::Request| async move {
            Ok::<_, Unhandled>(Response::text(String::from_utf8(req.body).unwrap()))
        })
        .unwrap();

    let response = roundtrip(
        &addr,
        "POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
         4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
    );
    assert!(response.ends_with("Wikipedia"));

    block_on(server.stop());
    block_on(task).unwrap();
}

#[test]
fn typed_captures_select_handlers() {
    let server = Arc::new(Server::bind("127.0.0.1:0").unwrap());
    let (addr, task) = start_server(&server);
    // The first route declines non-numeric ids; matching continues.
    server
        .route("GET /books/:id", |req: tern::Request| async move {
            let id: u32 = req.parameter("id")?;
            Ok(Response::text(format!("book #{}", id)))
        })
        .unwrap();
    server
        .route("GET /books/*", |_req: tern::Request| async move {
            Ok::<_, Unhandled>(Response::text("catalogue"))
        })
        .unwrap();

    let numeric = roundtrip(
        &addr,
        "GET /books/42 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    );
    assert!(numeric.ends_with("book #42"));

    let other = roundtrip(
        &addr,
        "GET /books/new HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    );
    assert!(other.ends_with("catalogue"));

    block_on(server.stop());
    block_on(task).unwrap();
}

#[test]
fn handlers_run_concurrently() {
    let server = Arc::new(Server::bind("127.0.0.1:0").unwrap());
    let (addr, task) = start_server(&server);
    server
        .route("GET /sleep", |_req: tern::Request| async move {
            sleep(Duration::from_secs(1)).await;
            Ok::<_, Unhandled>(Response::ok())
        })
        .unwrap();

    let started = Instant::now();
    let clients: Vec<_> = (0..2)
        .map(|_| {
            let addr = addr;
            std::thread::spawn(move || {
                roundtrip(
                    &addr,
                    "GET /sleep HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
                )
            })
        })
        .collect();
    for client in clients {
        let response = client.join().unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    }
    // Serial handling would need two full seconds.
    assert!(started.elapsed() < Duration::from_millis(1800));

    block_on(server.stop());
    block_on(task).unwrap();
}

#[test]
fn websocket_echo_end_to_end() {
    let server = Arc::new(Server::bind("127.0.0.1:0").unwrap());
    let (addr, task) = start_server(&server);
    server
        .route("GET /socket", |_req: tern::Request| async move {
            Ok::<_, Unhandled>(Response::upgrade(|incoming: MessageStream| incoming))
        })
        .unwrap();

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .write_all(
            b"GET /socket HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();

    // Read the 101 head up to the blank line.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    // Masked text frame "ping".
    let mask = [0x11u8, 0x22, 0x33, 0x44];
    let mut frame = vec![0x81, 0x80 | 4];
    frame.extend_from_slice(&mask);
    frame.extend(b"ping".iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    stream.write_all(&frame).unwrap();

    // The echo comes back unmasked.
    let mut reply = [0u8; 6];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply[0], 0x81);
    assert_eq!(reply[1], 4);
    assert_eq!(&reply[2..], b"ping");

    // Close handshake: masked close, expect an unmasked close back.
    stream.write_all(&[0x88, 0x80, 1, 2, 3, 4]).unwrap();
    let mut close = [0u8; 2];
    stream.read_exact(&mut close).unwrap();
    assert_eq!(close[0], 0x88);

    block_on(server.stop());
    block_on(task).unwrap();
}

#[test]
fn websocket_handler_messages() {
    // The stream-to-stream handler surface composes with combinators.
    use futures::StreamExt;
    let server = Arc::new(Server::bind("127.0.0.1:0").unwrap());
    let (addr, task) = start_server(&server);
    server
        .route("GET /shout", |_req: tern::Request| async move {
            Ok::<_, Unhandled>(Response::upgrade(|incoming: MessageStream| {
                Box::pin(incoming.map(|message| match message {
                    Message::Text(text) => Message::Text(text.to_uppercase()),
                    other => other,
                })) as MessageStream
            }))
        })
        .unwrap();

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .write_all(
            b"GET /shout HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .unwrap();
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }

    let mask = [9u8, 9, 9, 9];
    let mut frame = vec![0x81, 0x80 | 2];
    frame.extend_from_slice(&mask);
    frame.extend(b"hi".iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    stream.write_all(&frame).unwrap();

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply[2..], b"HI");

    block_on(server.stop());
    block_on(task).unwrap();
}

#[test]
fn stop_with_timeout_forces_stragglers_closed() {
    let server = Arc::new(Server::bind("127.0.0.1:0").unwrap());
    let (addr, task) = start_server(&server);
    server
        .route("GET /sleep", |_req: tern::Request| async move {
            sleep(Duration::from_secs(5)).await;
            Ok::<_, Unhandled>(Response::ok())
        })
        .unwrap();

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .write_all(b"GET /sleep HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    // Give the request time to reach the handler.
    std::thread::sleep(Duration::from_millis(200));

    let stopping = Instant::now();
    block_on(server.stop_within(Duration::from_millis(100)));
    block_on(task).unwrap();
    assert!(stopping.elapsed() < Duration::from_secs(1));

    // The in-flight connection was closed under us.
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Ok(0) | Err(_) => {}
        Ok(read) => {
            // At most a partial response could have escaped before the
            // socket was shut down; end-of-file must follow.
            let _ = read;
            assert_eq!(stream.read(&mut [0u8; 64]).unwrap_or(0), 0);
        }
    }
}

#[test]
fn cancelling_start_disconnects_idle_connections() {
    let server = Arc::new(Server::bind("127.0.0.1:0").unwrap());
    let (addr, task) = start_server(&server);

    let mut clients = Vec::new();
    for _ in 0..100 {
        clients.push(TcpStream::connect(&addr).unwrap());
    }
    // Let the accept loop pick everything up.
    std::thread::sleep(Duration::from_millis(300));

    block_on(task.cancel());

    for mut client in clients {
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 1];
        match client.read(&mut buf) {
            // End-of-file, or a reset for connections still in the backlog
            // when the listener closed.
            Ok(0) => {}
            Err(err) if err.kind() != std::io::ErrorKind::WouldBlock => {}
            Ok(n) => panic!("unexpected {} byte(s) from a cancelled server", n),
            Err(err) => panic!("expected end-of-file, got {}", err),
        }
    }
}

#[test]
fn poll_backend_serves_requests() {
    let address: SocketAddress = "127.0.0.1:0".parse().unwrap();
    let config = tern::ServerConfig::new(address).with_backend(tern::PoolBackend::poll());
    let server = Arc::new(Server::new(config));
    let (addr, task) = start_server(&server);
    server
        .route("GET /hello", |_req: tern::Request| async move {
            Ok::<_, Unhandled>(Response::text("hi"))
        })
        .unwrap();

    let response = roundtrip(
        &addr,
        "GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("hi"));

    block_on(server.stop());
    block_on(task).unwrap();
}

#[test]
fn unix_domain_sockets_serve_requests() {
    use std::os::unix::net::UnixStream;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("http.sock");
    let server = Arc::new(Server::new(tern::ServerConfig::new(SocketAddress::unix(
        &path,
    ))));
    server
        .route("GET /hello", |_req: tern::Request| async move {
            Ok::<_, Unhandled>(Response::text("hi"))
        })
        .unwrap();

    let task = spawn({
        let server = server.clone();
        async move { server.start().await }
    });
    block_on(server.wait_until_listening()).unwrap();

    let mut stream = UnixStream::connect(&path).unwrap();
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("hi"));

    block_on(server.stop());
    block_on(task).unwrap();
}

//! Socket pool behavior against real descriptors.

use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use tern::{block_on, spawn, EventSet, PoolBackend, SocketError, SocketPool};

fn connected_pair() -> (std::net::TcpStream, std::net::TcpStream) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();
    (client, server)
}

#[test]
fn suspend_resumes_on_readiness() {
    let pool = Arc::new(SocketPool::new(PoolBackend::Auto));
    pool.prepare().unwrap();
    let driver = spawn({
        let pool = pool.clone();
        async move { pool.run().await }
    });

    let (mut client, server) = connected_pair();
    let fd = server.as_raw_fd();

    let waiter = spawn({
        let pool = pool.clone();
        async move { pool.suspend(fd, EventSet::READ).await }
    });

    // Make sure the waiter is parked before readiness arrives.
    std::thread::sleep(Duration::from_millis(100));
    client.write_all(b"x").unwrap();

    block_on(waiter).unwrap();

    pool.stop();
    block_on(driver).unwrap();
    drop(server);
}

#[test]
fn stopping_the_pool_cancels_every_waiter() {
    let pool = Arc::new(SocketPool::new(PoolBackend::Auto));
    pool.prepare().unwrap();
    let driver = spawn({
        let pool = pool.clone();
        async move { pool.run().await }
    });

    let (_client, server) = connected_pair();
    let fd = server.as_raw_fd();

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            spawn({
                let pool = pool.clone();
                async move { pool.suspend(fd, EventSet::READ).await }
            })
        })
        .collect();

    std::thread::sleep(Duration::from_millis(100));
    pool.stop();

    for waiter in waiters {
        assert_eq!(block_on(waiter), Err(SocketError::Cancelled));
    }
    block_on(driver).unwrap();
}

#[test]
fn poll_backend_drives_readiness_too() {
    let pool = Arc::new(SocketPool::new(PoolBackend::poll()));
    pool.prepare().unwrap();
    let driver = spawn({
        let pool = pool.clone();
        async move { pool.run().await }
    });

    let (mut client, server) = connected_pair();
    let fd = server.as_raw_fd();

    let waiter = spawn({
        let pool = pool.clone();
        async move { pool.suspend(fd, EventSet::READ).await }
    });
    std::thread::sleep(Duration::from_millis(50));
    client.write_all(b"x").unwrap();
    block_on(waiter).unwrap();

    pool.stop();
    block_on(driver).unwrap();
    drop(server);
}

#[test]
fn prepare_reopens_a_stopped_pool() {
    let pool = Arc::new(SocketPool::new(PoolBackend::Auto));
    pool.prepare().unwrap();
    pool.stop();

    pool.prepare().unwrap();
    let driver = spawn({
        let pool = pool.clone();
        async move { pool.run().await }
    });
    std::thread::sleep(Duration::from_millis(50));
    pool.stop();
    block_on(driver).unwrap();
}

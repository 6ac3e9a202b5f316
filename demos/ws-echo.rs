//! A WebSocket echo server.
//!
//! Run with:
//!
//! ```sh
//! cargo run --example ws-echo
//! ```
//!
//! then connect a client to `ws://127.0.0.1:8080/socket`.

use tern::{MessageStream, Response, Server, Unhandled};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let server = Server::bind("127.0.0.1:8080")?;

    server.route("GET /socket", |_req: tern::Request| async move {
        Ok::<_, Unhandled>(Response::upgrade(|incoming: MessageStream| incoming))
    })?;

    tern::block_on(server.start())?;
    Ok(())
}

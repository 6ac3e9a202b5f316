//! A hello-world server.
//!
//! Run with:
//!
//! ```sh
//! cargo run --example hello
//! curl http://127.0.0.1:8080/hello/world
//! ```

use tern::{Request, Response, Server, Unhandled};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let server = Server::bind("127.0.0.1:8080")?;

    server.route("GET /hello/:name", |req: Request| async move {
        let name: String = req.parameter("name")?;
        Ok::<_, Unhandled>(Response::text(format!("hello, {}\n", name)))
    })?;

    server.route("GET /hello?time=*", |req: Request| async move {
        let time = req.query_value("time").unwrap_or("sometime").to_string();
        Ok::<_, Unhandled>(Response::text(format!("good {}\n", time)))
    })?;

    tern::block_on(server.start())?;
    Ok(())
}

//! The per-connection task.
//!
//! Each accepted connection runs one of these loops: decode a request,
//! dispatch it through the route table, write the response, repeat until
//! the peer goes away or either side asks to close. A response carrying an
//! upgrade hands the socket to the WebSocket framer instead.

use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_lite::io::BufReader;
use futures_lite::AsyncWriteExt;
use log::{debug, trace};

use crate::async_socket::AsyncSocket;
use crate::codec::{
    body_transport, decode_head, encode_response, read_body, BodyTransport, HttpError, Limits,
    CONTINUE_RESPONSE,
};
use crate::http::{Body, Method, Request, Response};
use crate::server::RouteTable;
use crate::websocket;

pub(crate) async fn serve_connection(
    socket: AsyncSocket,
    routes: Arc<RouteTable>,
    limits: Limits,
    stopping: Arc<AtomicBool>,
) {
    let fd = socket.socket().as_raw_fd();
    trace!("connection on fd {} open", fd);

    let mut reader = BufReader::new(socket.clone());
    let mut writer = socket.clone();

    loop {
        let mut request = match decode_head(&mut reader, &limits).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(HttpError::Io(err)) => {
                debug!("connection on fd {} failed: {}", fd, err);
                break;
            }
            Err(err) => {
                debug!("connection on fd {} sent a bad request: {}", fd, err);
                reject(&mut writer).await;
                break;
            }
        };

        let transport = match body_transport(&request.headers) {
            Ok(transport) => transport,
            Err(err) => {
                debug!("connection on fd {} sent a bad request: {}", fd, err);
                reject(&mut writer).await;
                break;
            }
        };

        // The peer may be holding the body back until we commit to reading.
        if transport != BodyTransport::None
            && request.headers.contains_token("Expect", "100-continue")
            && writer.write_all(CONTINUE_RESPONSE).await.is_err()
        {
            break;
        }

        match read_body(&mut reader, transport, &limits).await {
            Ok(body) => request.body = body,
            Err(HttpError::Io(err)) => {
                debug!("connection on fd {} failed: {}", fd, err);
                break;
            }
            Err(err) => {
                debug!("connection on fd {} sent a bad request: {}", fd, err);
                reject(&mut writer).await;
                break;
            }
        }

        trace!("fd {}: {} {}", fd, request.method, request.path);
        let head_only = request.method == Method::Head;
        let close_requested = request.wants_close();

        let response = dispatch(&routes, &request).await;
        let response_closes = response.wants_close();
        let Response {
            status,
            headers,
            body,
        } = response;

        match body {
            Body::Upgrade(handler) => {
                let accept = match upgrade_handshake(&request) {
                    Ok(accept) => accept,
                    Err(reason) => {
                        debug!("fd {}: rejected upgrade: {}", fd, reason);
                        reject(&mut writer).await;
                        break;
                    }
                };
                let mut switching = Response::status(101)
                    .with_header("Upgrade", "websocket")
                    .with_header("Connection", "Upgrade")
                    .with_header("Sec-WebSocket-Accept", accept);
                // Carry along anything the handler attached, e.g. a
                // negotiated subprotocol.
                for (name, value) in headers.iter() {
                    switching.headers.append(name, value);
                }
                if encode_response(&mut writer, switching, false, false)
                    .await
                    .is_err()
                {
                    break;
                }
                debug!("fd {} upgraded to websocket", fd);
                websocket::serve(reader, writer, handler).await;
                return;
            }
            body => {
                let close =
                    close_requested || response_closes || stopping.load(Ordering::SeqCst);
                let response = Response {
                    status,
                    headers,
                    body,
                };
                if let Err(err) = encode_response(&mut writer, response, head_only, close).await {
                    debug!("connection on fd {} failed to respond: {}", fd, err);
                    break;
                }
                if close {
                    break;
                }
            }
        }
    }
    trace!("connection on fd {} closed", fd);
}

/// Runs the matcher: the first route whose predicates hold and whose
/// handler does not decline wins; otherwise `404`.
pub(crate) async fn dispatch(routes: &RouteTable, request: &Request) -> Response {
    for (route, handler) in routes.snapshot().iter() {
        let captures = match route.matches(request) {
            Some(captures) => captures,
            None => continue,
        };
        let mut attempt = request.clone();
        attempt.set_parameters(captures);
        match handler.handle(attempt).await {
            Ok(response) => return response,
            Err(_unhandled) => continue,
        }
    }
    Response::not_found()
}

/// Validates an upgrade request and computes the accept key.
fn upgrade_handshake(request: &Request) -> Result<String, &'static str> {
    if request.method != Method::Get {
        return Err("upgrade requires GET");
    }
    if !request.headers.contains_token("Upgrade", "websocket") {
        return Err("missing Upgrade: websocket");
    }
    let key = request
        .headers
        .get("Sec-WebSocket-Key")
        .ok_or("missing Sec-WebSocket-Key")?;
    match base64::decode(key.trim()) {
        Ok(decoded) if decoded.len() == 16 => {}
        _ => return Err("invalid Sec-WebSocket-Key"),
    }
    Ok(websocket::accept_key(key))
}

/// Best-effort `400` before giving up on the connection.
async fn reject(writer: &mut AsyncSocket) {
    let _ = encode_response(writer, Response::bad_request(), false, true).await;
}

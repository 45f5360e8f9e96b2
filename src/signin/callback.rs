use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use url::Url;

use crate::error::AuthError;

const SUCCESS_PAGE: &str = "<!DOCTYPE html><html><body><h1>Sign-in complete</h1>\
     <p>You can close this window and return to your conversation.</p></body></html>";
const MISMATCH_PAGE: &str = "<!DOCTYPE html><html><body><h1>Sign-in request not recognized</h1>\
     <p>This link does not belong to the pending sign-in. Start again from the original request.</p></body></html>";
const NOT_FOUND_PAGE: &str = "<!DOCTYPE html><html><body><h1>Not found</h1></body></html>";

/// How long an accepted connection may stay silent before it is dropped.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Parsed query of an inbound callback request.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    pub fn from_query(query: &str) -> Self {
        let mut map: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        let mut take = |k: &str| map.remove(k).filter(|v| !v.is_empty());
        Self {
            code: take("code"),
            state: take("state"),
            error: take("error"),
            error_description: take("error_description"),
        }
    }
}

/// Split `GET /path?query HTTP/1.1` into path and query.
pub fn parse_request_line(request: &str) -> Option<(&str, &str)> {
    let first_line = request.lines().next()?;
    let target = first_line.split_whitespace().nth(1)?;
    Some(target.split_once('?').unwrap_or((target, "")))
}

/// Bind the listener for a redirect target. Port 0 picks a free port; the
/// returned URI carries the port actually bound.
pub async fn bind_redirect(redirect_uri: &str) -> Result<(TcpListener, String), AuthError> {
    let mut url = Url::parse(redirect_uri).map_err(|e| {
        AuthError::SignInFailed(format!("invalid redirect target {redirect_uri}: {e}"))
    })?;
    let port = url.port_or_known_default().unwrap_or(80);
    let ip = match url.host_str() {
        Some("localhost") | Some("127.0.0.1") | Some("[::1]") | None => "127.0.0.1",
        Some(_) => "0.0.0.0",
    };
    let addr: SocketAddr = format!("{ip}:{port}")
        .parse()
        .map_err(|e| AuthError::SignInFailed(format!("cannot listen on {ip}:{port}: {e}")))?;
    let listener = TcpListener::bind(addr).await.map_err(|e| match e.kind() {
        ErrorKind::AddrInUse => AuthError::SignInFailed(format!(
            "redirect port {port} is already in use; another sign-in may be pending"
        )),
        _ => AuthError::from(e),
    })?;
    let bound = listener.local_addr()?.port();
    if bound != port {
        // Only reachable when the configured port was 0.
        let _ = url.set_port(Some(bound));
    }
    tracing::debug!(port = bound, "sign-in callback listener bound");
    Ok((listener, url.to_string()))
}

/// Serve callback requests until one carries `expected_state` on
/// `expected_path`, then return its authorization code.
///
/// Requests for other paths get a 404 and requests with a different state
/// get a 400; neither ends the wait. Each connection is served on its own
/// task, so a client that connects and never sends a request cannot hold
/// up the browser redirect.
pub async fn wait_for_code(
    listener: &TcpListener,
    expected_path: &str,
    expected_state: &str,
) -> Result<String, AuthError> {
    let expected_path: Arc<str> = Arc::from(expected_path);
    let expected_state: Arc<str> = Arc::from(expected_state);
    let (tx, mut rx) = mpsc::channel(1);
    // Dropping the set aborts connections still in flight.
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let tx = tx.clone();
                let path = Arc::clone(&expected_path);
                let state = Arc::clone(&expected_state);
                connections.spawn(async move {
                    if let Some(result) = serve_callback(stream, peer, &path, &state).await {
                        let _ = tx.send(result).await;
                    }
                });
            }
            Some(result) = rx.recv() => return result,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

/// Answer one callback connection. `None` means the request did not settle
/// the sign-in and the listener keeps waiting.
async fn serve_callback(
    mut stream: TcpStream,
    peer: SocketAddr,
    expected_path: &str,
    expected_state: &str,
) -> Option<Result<String, AuthError>> {
    let mut buf = vec![0u8; 8192];
    let n = match tokio::time::timeout(READ_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            tracing::debug!(%peer, "callback read failed: {e}");
            return None;
        }
        Err(_) => {
            tracing::debug!(%peer, "callback connection sent no request, closing");
            return None;
        }
    };
    let request = String::from_utf8_lossy(&buf[..n]);

    let Some((path, query)) = parse_request_line(&request) else {
        respond(&mut stream, "400 Bad Request", NOT_FOUND_PAGE).await;
        return None;
    };
    if path != expected_path {
        respond(&mut stream, "404 Not Found", NOT_FOUND_PAGE).await;
        return None;
    }

    let params = CallbackParams::from_query(query);
    if params.state.as_deref() != Some(expected_state) {
        tracing::warn!(%peer, "{}", AuthError::StateMismatch);
        respond(&mut stream, "400 Bad Request", MISMATCH_PAGE).await;
        return None;
    }

    if let Some(error) = params.error {
        let detail = match params.error_description {
            Some(desc) => format!("{error}: {desc}"),
            None => error.clone(),
        };
        respond(&mut stream, "200 OK", &failure_page(&detail)).await;
        return Some(Err(if error == "access_denied" {
            AuthError::UserCancelled(detail)
        } else {
            AuthError::SignInFailed(detail)
        }));
    }

    Some(match params.code {
        Some(code) => {
            respond(&mut stream, "200 OK", SUCCESS_PAGE).await;
            Ok(code)
        }
        None => {
            let detail = "callback carried no authorization code";
            respond(&mut stream, "200 OK", &failure_page(detail)).await;
            Err(AuthError::SignInFailed(detail.into()))
        }
    })
}

fn failure_page(detail: &str) -> String {
    let escaped = detail
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    format!(
        "<!DOCTYPE html><html><body><h1>Sign-in did not complete</h1><p>{escaped}</p></body></html>"
    )
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        tracing::debug!("callback response write failed: {e}");
    }
    let _ = stream.shutdown().await;
}

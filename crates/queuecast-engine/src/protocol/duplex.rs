use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tungstenite::handshake::HandshakeError;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{client_tls, Message as WsMessage, WebSocket};

use super::payload::QueueProfile;
use super::{resolve_completion, BackendError};

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// What to do after one server frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    Reply(Value),
    Completed(String),
    Ignore,
}

/// Handshake state for one socket job; pure so it can be driven without I/O.
pub(crate) struct Session {
    token: String,
    profile: QueueProfile,
    data: Value,
    file_base: String,
}

impl Session {
    pub(crate) fn new(token: &str, profile: QueueProfile, data: Value, base_url: &str) -> Self {
        Self {
            token: token.to_string(),
            profile,
            data,
            file_base: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub(crate) fn on_message(&self, event: &Value) -> Result<Step, BackendError> {
        match event.get("msg").and_then(Value::as_str) {
            Some("send_hash") => Ok(Step::Reply(json!({
                "fn_index": self.profile.hash_fn_index,
                "session_hash": self.token,
            }))),
            Some("send_data") => Ok(Step::Reply(json!({
                "data": self.data,
                "event_data": null,
                "fn_index": self.profile.fn_index,
                "session_hash": self.token,
            }))),
            Some("queue_full") => Err(BackendError::UpstreamFailed("queue is full".to_string())),
            Some("process_completed") => {
                let name = resolve_completion(event, self.profile.result_path, None)?;
                Ok(Step::Completed(self.file_url(&name)))
            }
            _ => Ok(Step::Ignore),
        }
    }

    fn file_url(&self, name: &str) -> String {
        if name.starts_with("http://") || name.starts_with("https://") {
            name.to_string()
        } else {
            format!("{}/file={name}", self.file_base)
        }
    }
}

/// Runs one job over `{ws-base}/queue/join`. The socket is closed on every exit.
pub(crate) fn run(base_url: &str, session: Session, timeout: Duration) -> Result<String, BackendError> {
    let started = Instant::now();
    let url = socket_url(base_url)?;
    let mut ws = open_socket(&url, started, timeout)?;
    set_socket_read_timeout(&mut ws, Some(SOCKET_READ_TIMEOUT));

    let outcome = drive(&mut ws, &session, started, timeout);
    close_socket(&mut ws);
    outcome
}

/// TCP connect, TLS and websocket handshake, all inside the job's budget.
fn open_socket(url: &str, started: Instant, timeout: Duration) -> Result<Socket, BackendError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|err| BackendError::Transport(format!("invalid socket url '{url}': {err}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| BackendError::Transport(format!("socket url '{url}' has no host")))?;
    let port = parsed.port_or_known_default().unwrap_or(443);
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|err| BackendError::Transport(format!("cannot resolve {host}: {err}")))?;

    let mut last_err = None;
    let mut stream = None;
    for addr in addrs {
        let Some(remaining) = timeout.checked_sub(started.elapsed()) else {
            return Err(BackendError::TimedOut(timeout));
        };
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(connected) => {
                stream = Some(connected);
                break;
            }
            Err(err) if err.kind() == ErrorKind::TimedOut => {
                return Err(BackendError::TimedOut(timeout));
            }
            Err(err) => last_err = Some(err),
        }
    }
    let Some(stream) = stream else {
        return Err(BackendError::Transport(match last_err {
            Some(err) => format!("socket connect failed: {err}"),
            None => format!("no addresses for {host}"),
        }));
    };

    let remaining = timeout
        .checked_sub(started.elapsed())
        .filter(|left| !left.is_zero())
        .ok_or(BackendError::TimedOut(timeout))?;
    let _ = stream.set_read_timeout(Some(remaining));
    let _ = stream.set_write_timeout(Some(remaining));
    match client_tls(url, stream) {
        Ok((ws, _)) => Ok(ws),
        Err(HandshakeError::Interrupted(_)) => Err(BackendError::TimedOut(timeout)),
        Err(HandshakeError::Failure(tungstenite::Error::Io(err)))
            if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
        {
            Err(BackendError::TimedOut(timeout))
        }
        Err(HandshakeError::Failure(err)) => Err(BackendError::Transport(format!(
            "socket handshake failed: {err}"
        ))),
    }
}

fn drive(
    ws: &mut Socket,
    session: &Session,
    started: Instant,
    timeout: Duration,
) -> Result<String, BackendError> {
    loop {
        if started.elapsed() > timeout {
            return Err(BackendError::TimedOut(timeout));
        }

        let message = match ws.read() {
            Ok(message) => message,
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(err) => {
                return Err(BackendError::ChannelTerminated(format!(
                    "socket read failed: {err}"
                )))
            }
        };

        let raw = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            WsMessage::Close(_) => {
                return Err(BackendError::ChannelTerminated(
                    "socket closed before completion".to_string(),
                ))
            }
            _ => continue,
        };
        let event: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(_) => continue,
        };

        match session.on_message(&event)? {
            Step::Reply(reply) => send_json(ws, &reply)?,
            Step::Completed(locator) => return Ok(locator),
            Step::Ignore => {}
        }
    }
}

fn send_json(ws: &mut Socket, value: &Value) -> Result<(), BackendError> {
    ws.send(WsMessage::Text(value.to_string().into()))
        .map_err(|err| BackendError::ChannelTerminated(format!("socket send failed: {err}")))
}

fn close_socket(ws: &mut Socket) {
    if ws.can_write() {
        let _ = ws.close(None);
        let _ = ws.flush();
    }
}

fn set_socket_read_timeout(ws: &mut Socket, timeout: Option<Duration>) {
    match ws.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            let _ = stream.set_read_timeout(timeout);
        }
        MaybeTlsStream::Rustls(stream) => {
            let _ = stream.get_mut().set_read_timeout(timeout);
        }
        _ => {}
    }
}

fn socket_url(base_url: &str) -> Result<String, BackendError> {
    let mut url = reqwest::Url::parse(base_url)
        .map_err(|err| BackendError::Transport(format!("invalid socket base '{base_url}': {err}")))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => other,
    }
    .to_string();
    let _ = url.set_scheme(&scheme);
    let path = format!("{}/queue/join", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url.to_string())
}

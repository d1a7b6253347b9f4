use std::io::{self, BufRead, BufReader};
use std::time::Duration;

use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use super::payload::{self, PathStep, QueueProfile};
use super::{resolve_completion, BackendError};

const COMPLETED: &str = "process_completed";

pub(crate) struct Target<'a> {
    pub base_url: &'a str,
    pub profile: QueueProfile,
    pub placeholder: Option<&'a str>,
    pub timeout: Duration,
}

/// Join the queue, then read the session's event stream to completion.
pub(crate) fn run(
    http: &HttpClient,
    target: &Target<'_>,
    token: &str,
    data: Value,
) -> Result<String, BackendError> {
    if let Some(warmup) = target.profile.warmup {
        post_checked(
            http,
            &format!("{}/run/predict", target.base_url),
            &json!({
                "data": payload::warmup_data(),
                "event_data": null,
                "fn_index": warmup.fn_index,
                "trigger_id": warmup.trigger_id,
                "session_hash": token,
            }),
            target.timeout,
        )?;
    }

    post_checked(
        http,
        &format!("{}/queue/join", target.base_url),
        &json!({
            "data": data,
            "event_data": null,
            "fn_index": target.profile.fn_index,
            "trigger_id": target.profile.trigger_id,
            "session_hash": token,
        }),
        target.timeout,
    )?;

    let response = http
        .get(format!("{}/queue/data", target.base_url))
        .query(&[("session_hash", token)])
        .timeout(target.timeout)
        .send()
        .map_err(|err| BackendError::from_reqwest("event stream request failed", err, target.timeout))?;
    let status = response.status();
    if !status.is_success() {
        return Err(BackendError::ChannelTerminated(format!(
            "event stream answered {status}"
        )));
    }

    // The reader owns the response; it is dropped, closing the channel, on return.
    scan_event_stream(
        BufReader::new(response),
        target.profile.result_path,
        target.placeholder,
        target.timeout,
    )
}

fn post_checked(
    http: &HttpClient,
    url: &str,
    body: &Value,
    timeout: Duration,
) -> Result<(), BackendError> {
    let response = http
        .post(url)
        .timeout(timeout)
        .json(body)
        .send()
        .map_err(|err| BackendError::from_reqwest("queue join failed", err, timeout))?;
    let status = response.status();
    if !status.is_success() {
        return Err(BackendError::JoinRejected {
            status: status.as_u16(),
        });
    }
    Ok(())
}

/// Reads events until the first completion.
///
/// Each line is parsed from its first `{`, so `data: ` framing and bare JSON
/// lines both work. Lines that are not JSON are skipped unless they claim to
/// be the completion.
pub(crate) fn scan_event_stream<R: BufRead>(
    reader: R,
    path: &[PathStep],
    placeholder: Option<&str>,
    timeout: Duration,
) -> Result<String, BackendError> {
    for line in reader.lines() {
        let line = line.map_err(|err| read_error(err, timeout))?;
        let Some(start) = line.find('{') else {
            continue;
        };
        let event: Value = match serde_json::from_str(&line[start..]) {
            Ok(event) => event,
            Err(err) if line.contains(COMPLETED) => {
                return Err(BackendError::MalformedResponse(format!(
                    "unparseable completion event: {err}"
                )));
            }
            Err(_) => continue,
        };
        match event.get("msg").and_then(Value::as_str) {
            Some(COMPLETED) => return resolve_completion(&event, path, placeholder),
            Some("queue_full") => {
                return Err(BackendError::UpstreamFailed("queue is full".to_string()))
            }
            Some(msg) => tracing::trace!(msg, "queue event"),
            None => {}
        }
    }
    Err(BackendError::ChannelTerminated(
        "event stream ended before completion".to_string(),
    ))
}

fn read_error(err: io::Error, timeout: Duration) -> BackendError {
    let body_timeout = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
        .is_some_and(reqwest::Error::is_timeout);
    if body_timeout || matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) {
        BackendError::TimedOut(timeout)
    } else {
        BackendError::ChannelTerminated(format!("event stream read failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, BufRead, Cursor, Read};
    use std::time::Duration;

    use queuecast_contracts::catalog::BackendKind;

    use super::scan_event_stream;
    use crate::protocol::payload::profile;
    use crate::protocol::BackendError;

    const TIMEOUT: Duration = Duration::from_secs(300);

    fn scan(kind: BackendKind, body: &str, placeholder: Option<&str>) -> Result<String, BackendError> {
        scan_event_stream(
            Cursor::new(body.as_bytes().to_vec()),
            profile(kind).result_path,
            placeholder,
            TIMEOUT,
        )
    }

    #[test]
    fn first_completion_wins() {
        let body = concat!(
            "data: {\"msg\": \"process_completed\", \"output\": {\"data\": [[{\"image\": {\"url\": \"https://x/1.png\"}}]]}}\n",
            "data: {\"msg\": \"process_completed\", \"output\": {\"data\": [[{\"image\": {\"url\": \"https://x/2.png\"}}]]}}\n",
        );
        assert_eq!(scan(BackendKind::DalleXl, body, None).unwrap(), "https://x/1.png");
    }

    #[test]
    fn noise_lines_are_skipped() {
        let body = concat!(
            ": keep-alive\n",
            "data: {broken\n",
            "event: heartbeat\n",
            "{\"msg\": \"process_completed\", \"output\": {\"data\": [{\"url\": \"https://x/a.wav\"}]}}\n",
        );
        assert_eq!(scan(BackendKind::MeloTts, body, None).unwrap(), "https://x/a.wav");
    }

    #[test]
    fn broken_completion_is_malformed() {
        let body = "data: {\"msg\": \"process_completed\", \"output\": \n";
        assert!(matches!(
            scan(BackendKind::SdxlTcd, body, Some("p")),
            Err(BackendError::MalformedResponse(_))
        ));
    }

    #[test]
    fn queue_full_is_upstream_failure() {
        let body = "data: {\"msg\": \"queue_full\"}\n";
        assert!(matches!(
            scan(BackendKind::SdxlTcd, body, Some("p")),
            Err(BackendError::UpstreamFailed(_))
        ));
    }

    #[test]
    fn empty_stream_is_terminated() {
        assert!(matches!(
            scan(BackendKind::SdxlTcd, "", Some("p")),
            Err(BackendError::ChannelTerminated(_))
        ));
    }

    struct StalledReader;

    impl Read for StalledReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
        }
    }

    #[test]
    fn read_timeout_maps_to_timed_out() {
        let reader: Box<dyn BufRead> = Box::new(io::BufReader::new(StalledReader));
        let err = scan_event_stream(reader, profile(BackendKind::SdxlTcd).result_path, None, TIMEOUT)
            .unwrap_err();
        assert_eq!(err, BackendError::TimedOut(TIMEOUT));
    }
}

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use queuecast_contracts::state::{Requester, ResponseStyle};
use queuecast_contracts::surface::{
    Attachment, CancelSignal, ChatSurface, Controls, Embed, MessageRef, OutgoingMessage,
};

use crate::conversation::FragmentStream;
use crate::retry::{RetryPolicy, UpstreamExhausted};

pub const OVERFLOW_NOTICE: &str =
    "> `The response is too large and will be sent as a text file once it is ready.`";
pub const RESPONSE_EMBED_COLOR: u32 = 0x505050;

const CANCEL_POLL: Duration = Duration::from_millis(200);
const NOTICE_TTL: Duration = Duration::from_secs(5);

/// Where one streamed reply is rendered.
pub struct StreamTarget {
    pub surface: Arc<dyn ChatSurface>,
    pub message: MessageRef,
    pub requester: Requester,
    pub style: ResponseStyle,
    pub cancel: CancelSignal,
    /// Offer a save control next to settings once the reply is complete.
    pub save_button: bool,
}

#[derive(Debug)]
pub enum StreamOutcome {
    Completed {
        text: String,
        overflowed: bool,
        attempts: usize,
    },
    Cancelled,
    Failed(UpstreamExhausted<anyhow::Error>),
}

enum Attempt {
    Completed { text: String, overflowed: bool },
    Cancelled,
}

/// Coalesces a fragment stream into rate-limited edits of one message.
#[derive(Debug, Clone)]
pub struct StreamAggregator {
    edit_interval: Duration,
    retry: RetryPolicy,
    notice_ttl: Duration,
}

impl StreamAggregator {
    pub fn new(edit_interval: Duration, retry: RetryPolicy) -> Self {
        Self {
            edit_interval,
            retry,
            notice_ttl: NOTICE_TTL,
        }
    }

    /// Runs `open` up to the retry budget, each time consuming a fresh stream.
    pub fn run<F>(&self, target: &StreamTarget, mut open: F) -> StreamOutcome
    where
        F: FnMut() -> Result<FragmentStream>,
    {
        let mut last_render: Option<OutgoingMessage> = None;
        let mut attempts = 0;
        let result = self.retry.run_observed(
            |attempt| {
                attempts = attempt;
                if target.cancel.is_cancelled() {
                    return Ok(Attempt::Cancelled);
                }
                let outcome = open().and_then(|stream| self.consume(target, stream, &mut last_render));
                match outcome {
                    Err(_) if target.cancel.is_cancelled() => Ok(Attempt::Cancelled),
                    other => other,
                }
            },
            |_, err| self.post_retry_notice(target, err),
        );

        match result {
            Ok(Attempt::Completed { text, overflowed }) => StreamOutcome::Completed {
                text,
                overflowed,
                attempts,
            },
            Ok(Attempt::Cancelled) => StreamOutcome::Cancelled,
            Err(exhausted) => {
                self.post_failure(target, &exhausted, last_render);
                StreamOutcome::Failed(exhausted)
            }
        }
    }

    fn consume(
        &self,
        target: &StreamTarget,
        stream: FragmentStream,
        last_render: &mut Option<OutgoingMessage>,
    ) -> Result<Attempt> {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for item in stream {
                let failed = item.is_err();
                if tx.send(item).is_err() || failed {
                    break;
                }
            }
        });

        let threshold = target.style.overflow_threshold();
        let mut buffer = String::new();
        let mut buffer_chars = 0usize;
        let mut overflowed = false;
        let mut pending: Option<Instant> = None;

        loop {
            if target.cancel.is_cancelled() {
                return Ok(Attempt::Cancelled);
            }
            let wait = pending
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(CANCEL_POLL);
            match rx.recv_timeout(wait) {
                Ok(Ok(fragment)) => {
                    if target.cancel.is_cancelled() {
                        return Ok(Attempt::Cancelled);
                    }
                    buffer_chars += fragment.chars().count();
                    buffer.push_str(&fragment);
                    if buffer_chars > threshold {
                        if !overflowed {
                            overflowed = true;
                            pending = None;
                            let notice = OutgoingMessage::text(OVERFLOW_NOTICE)
                                .with_controls(Controls::StopGenerating);
                            self.edit(target, notice, last_render);
                        }
                    } else if pending.is_none() {
                        pending = Some(Instant::now() + self.edit_interval);
                    }
                }
                Ok(Err(err)) => return Err(err),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if pending.is_some_and(|deadline| Instant::now() >= deadline) {
                pending = None;
                if target.cancel.is_cancelled() {
                    return Ok(Attempt::Cancelled);
                }
                if !buffer.trim().is_empty() {
                    let render = self.render(target, &buffer, Controls::StopGenerating);
                    self.edit(target, render, last_render);
                }
            }
        }

        if target.cancel.is_cancelled() {
            return Ok(Attempt::Cancelled);
        }
        self.finish(target, &buffer, overflowed, last_render);
        Ok(Attempt::Completed {
            text: buffer,
            overflowed,
        })
    }

    fn finish(
        &self,
        target: &StreamTarget,
        text: &str,
        overflowed: bool,
        last_render: &mut Option<OutgoingMessage>,
    ) {
        if overflowed {
            let file = OutgoingMessage::text("Here is the response:")
                .mentioning(target.requester.user_id.as_str())
                .with_attachment(Attachment::Text {
                    name: format!("response-{}.txt", chrono::Utc::now().timestamp_millis()),
                    body: text.to_string(),
                })
                .with_controls(Controls::Settings);
            if let Err(err) = target.surface.send(&target.message.channel, file) {
                tracing::warn!("failed to deliver response file: {err:#}");
            }
            let notice = OutgoingMessage::text(OVERFLOW_NOTICE).with_controls(Controls::Settings);
            self.edit(target, notice, last_render);
            return;
        }
        let controls = if target.save_button {
            Controls::SettingsAndSave
        } else {
            Controls::None
        };
        let render = self.render(target, text, controls);
        self.edit(target, render, last_render);
    }

    fn render(&self, target: &StreamTarget, text: &str, controls: Controls) -> OutgoingMessage {
        let message = match target.style {
            ResponseStyle::Plain => OutgoingMessage::text(text),
            ResponseStyle::Embedded => OutgoingMessage::embed(
                Embed::new("📝 **Response:**", text, RESPONSE_EMBED_COLOR).field(
                    "❓ **Questioned by:**",
                    target.requester.display_name.as_str(),
                    false,
                ),
            ),
        };
        message.with_controls(controls)
    }

    fn edit(
        &self,
        target: &StreamTarget,
        message: OutgoingMessage,
        last_render: &mut Option<OutgoingMessage>,
    ) {
        match target.surface.edit(&target.message, message.clone()) {
            Ok(()) => *last_render = Some(message),
            Err(err) => tracing::warn!("failed to update streamed message: {err:#}"),
        }
    }

    fn post_retry_notice(&self, target: &StreamTarget, err: &anyhow::Error) {
        let notice = OutgoingMessage::text(format!(
            "Generation Attempts Failed, Retrying.. ```{err}```"
        ))
        .mentioning(target.requester.user_id.as_str());
        let sent = match target.surface.send(&target.message.channel, notice) {
            Ok(sent) => sent,
            Err(err) => {
                tracing::warn!("failed to post retry notice: {err:#}");
                return;
            }
        };
        let surface = Arc::clone(&target.surface);
        let ttl = self.notice_ttl;
        thread::spawn(move || {
            thread::sleep(ttl);
            if let Err(err) = surface.delete(&sent) {
                tracing::debug!("failed to remove retry notice: {err:#}");
            }
        });
    }

    fn post_failure(
        &self,
        target: &StreamTarget,
        exhausted: &UpstreamExhausted<anyhow::Error>,
        last_render: Option<OutgoingMessage>,
    ) {
        let notice = OutgoingMessage::text(format!(
            "All Generation Attempts Failed :( ```{}```",
            exhausted.last
        ))
        .mentioning(target.requester.user_id.as_str())
        .with_controls(Controls::Settings);
        if let Err(err) = target.surface.send(&target.message.channel, notice) {
            tracing::warn!("failed to post failure notice: {err:#}");
        }
        let restored = last_render
            .unwrap_or_else(|| OutgoingMessage::text(crate::THINKING_NOTICE))
            .with_controls(Controls::Settings);
        if let Err(err) = target.surface.edit(&target.message, restored) {
            tracing::warn!("failed to update streamed message: {err:#}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use anyhow::anyhow;
    use queuecast_contracts::state::{Requester, ResponseStyle};
    use queuecast_contracts::surface::{
        Attachment, CancelSignal, ChatSurface, Controls, MessageRef, OutgoingMessage,
    };

    use super::{StreamAggregator, StreamOutcome, StreamTarget, OVERFLOW_NOTICE};
    use crate::conversation::{ConversationModel, DryrunModel, FragmentStream};
    use crate::retry::RetryPolicy;

    #[derive(Debug, Clone)]
    pub(crate) enum Call {
        Send(String, OutgoingMessage),
        Edit(MessageRef, OutgoingMessage, Instant),
        Delete(MessageRef),
    }

    /// Records every surface call; `arm_cancel` hands out one shared signal.
    #[derive(Default)]
    pub(crate) struct RecordingSurface {
        pub calls: Mutex<Vec<Call>>,
        pub cancel: Mutex<Option<CancelSignal>>,
        next_id: Mutex<u64>,
    }

    impl RecordingSurface {
        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn edits(&self) -> Vec<(OutgoingMessage, Instant)> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Edit(_, message, at) => Some((message, at)),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn sends(&self) -> Vec<OutgoingMessage> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Send(_, message) => Some(message),
                    _ => None,
                })
                .collect()
        }
    }

    impl ChatSurface for RecordingSurface {
        fn send(&self, channel: &str, message: OutgoingMessage) -> anyhow::Result<MessageRef> {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            self.calls
                .lock()
                .unwrap()
                .push(Call::Send(channel.to_string(), message));
            Ok(MessageRef {
                channel: channel.to_string(),
                id: format!("m-{}", *next),
            })
        }

        fn edit(&self, target: &MessageRef, message: OutgoingMessage) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Edit(target.clone(), message, Instant::now()));
            Ok(())
        }

        fn delete(&self, target: &MessageRef) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(Call::Delete(target.clone()));
            Ok(())
        }

        fn arm_cancel(&self, _target: &MessageRef, _requester: &str, window: Duration) -> CancelSignal {
            let signal = CancelSignal::armed(window);
            *self.cancel.lock().unwrap() = Some(signal.clone());
            signal
        }
    }

    const INTERVAL: Duration = Duration::from_millis(60);

    fn target(surface: &Arc<RecordingSurface>, style: ResponseStyle) -> StreamTarget {
        StreamTarget {
            surface: surface.clone(),
            message: MessageRef {
                channel: "c-1".to_string(),
                id: "m-0".to_string(),
            },
            requester: Requester::direct("u-1", "Ada"),
            style,
            cancel: CancelSignal::armed(Duration::from_secs(300)),
            save_button: true,
        }
    }

    fn aggregator() -> StreamAggregator {
        StreamAggregator::new(INTERVAL, RetryPolicy::new(3, Duration::from_millis(10)))
    }

    fn open(model: &DryrunModel) -> impl FnMut() -> anyhow::Result<FragmentStream> + '_ {
        move || model.open_stream(&[], "prompt")
    }

    #[test]
    fn streamed_edits_are_spaced_by_interval() {
        let surface = Arc::new(RecordingSurface::default());
        let model = DryrunModel::new()
            .with_fragments((0..12).map(|idx| format!("word{idx} ")))
            .with_delay(Duration::from_millis(20));

        let outcome = aggregator().run(&target(&surface, ResponseStyle::Plain), open(&model));
        let StreamOutcome::Completed { text, overflowed, attempts } = outcome else {
            panic!("expected completion");
        };
        assert!(!overflowed);
        assert_eq!(attempts, 1);
        assert!(text.starts_with("word0 word1"));

        let edits = surface.edits();
        let streaming: Vec<_> = edits
            .iter()
            .filter(|(message, _)| message.controls == Controls::StopGenerating)
            .collect();
        assert!(streaming.len() >= 2, "expected intermediate edits");
        assert!(streaming.len() < 12, "edits must be coalesced");
        for pair in streaming.windows(2) {
            assert!(pair[1].1.duration_since(pair[0].1) >= INTERVAL);
        }
        let (last, _) = edits.last().unwrap();
        assert_eq!(last.content.as_deref(), Some(text.as_str()));
        assert_eq!(last.controls, Controls::SettingsAndSave);
    }

    #[test]
    fn embedded_style_renders_embed() {
        let surface = Arc::new(RecordingSurface::default());
        let model = DryrunModel::new().with_fragments(["hello ", "there"]);
        let outcome = aggregator().run(&target(&surface, ResponseStyle::Embedded), open(&model));
        assert!(matches!(outcome, StreamOutcome::Completed { .. }));
        let (last, _) = surface.edits().pop().unwrap();
        let embed = last.embed.unwrap();
        assert_eq!(embed.description, "hello there");
        assert_eq!(embed.fields[0].value, "Ada");
        assert!(last.content.is_none());
    }

    #[test]
    fn large_response_overflows_once_and_ships_file() {
        let surface = Arc::new(RecordingSurface::default());
        let fragments: Vec<String> = (0..100).map(|_| "x".repeat(100)).collect();
        let model = DryrunModel::new().with_fragments(fragments);

        let outcome = aggregator().run(&target(&surface, ResponseStyle::Plain), open(&model));
        let StreamOutcome::Completed { text, overflowed, .. } = outcome else {
            panic!("expected completion");
        };
        assert!(overflowed);
        assert_eq!(text.len(), 10_000);

        let notices = surface
            .edits()
            .into_iter()
            .filter(|(message, _)| {
                message.content.as_deref() == Some(OVERFLOW_NOTICE)
                    && message.controls == Controls::StopGenerating
            })
            .count();
        assert_eq!(notices, 1);
        assert!(surface
            .edits()
            .iter()
            .all(|(message, _)| message.content.as_deref().map_or(0, str::len) <= 1900));

        let sends = surface.sends();
        assert_eq!(sends.len(), 1);
        let Attachment::Text { name, body } = &sends[0].attachments[0] else {
            panic!("expected text attachment");
        };
        assert!(name.starts_with("response-") && name.ends_with(".txt"));
        assert_eq!(body.len(), 10_000);
        assert_eq!(sends[0].mention.as_deref(), Some("u-1"));
    }

    #[test]
    fn no_edits_after_cancel() {
        let surface = Arc::new(RecordingSurface::default());
        let model = DryrunModel::new()
            .with_fragments((0..50).map(|idx| format!("t{idx} ")))
            .with_delay(Duration::from_millis(10));
        let target = target(&surface, ResponseStyle::Plain);
        let cancel = target.cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            assert!(cancel.request());
            Instant::now()
        });

        let outcome = aggregator().run(&target, open(&model));
        let cancelled_at = canceller.join().unwrap();
        assert!(matches!(outcome, StreamOutcome::Cancelled));
        // Allow an edit already in flight when the flag flipped.
        let slack = Duration::from_millis(5);
        assert!(surface
            .edits()
            .iter()
            .all(|(_, at)| *at <= cancelled_at + slack));
        assert!(surface.sends().is_empty());
    }

    #[test]
    fn failing_attempts_notify_then_exhaust() {
        let surface = Arc::new(RecordingSurface::default());
        let mut opened = 0;
        let outcome = aggregator().run(&target(&surface, ResponseStyle::Plain), || {
            opened += 1;
            Err(anyhow!("model overloaded"))
        });
        let StreamOutcome::Failed(exhausted) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(opened, 3);

        let sends = surface.sends();
        assert_eq!(sends.len(), 3);
        assert!(sends[0]
            .content
            .as_deref()
            .unwrap()
            .starts_with("Generation Attempts Failed, Retrying.."));
        assert!(sends[2]
            .content
            .as_deref()
            .unwrap()
            .starts_with("All Generation Attempts Failed :("));
        let (last, _) = surface.edits().pop().unwrap();
        assert_eq!(last.controls, Controls::Settings);
    }

    #[test]
    fn mid_stream_error_retries_with_fresh_buffer() {
        let surface = Arc::new(RecordingSurface::default());
        let mut opened = 0;
        let outcome = aggregator().run(&target(&surface, ResponseStyle::Plain), || {
            opened += 1;
            let items: Vec<anyhow::Result<String>> = if opened == 1 {
                vec![Ok("partial ".to_string()), Err(anyhow!("stream reset"))]
            } else {
                vec![Ok("complete answer".to_string())]
            };
            Ok(Box::new(items.into_iter()) as FragmentStream)
        });
        let StreamOutcome::Completed { text, attempts, .. } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(text, "complete answer");
        assert_eq!(attempts, 2);
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub channel: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    /// Remote file the surface fetches and attaches by URL.
    Url { url: String, name: String },
    /// Text generated locally, attached as a file.
    Text { name: String, body: String },
}

impl Attachment {
    pub fn name(&self) -> &str {
        match self {
            Self::Url { name, .. } | Self::Text { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub fields: Vec<EmbedField>,
}

impl Embed {
    pub fn new(title: impl Into<String>, description: impl Into<String>, color: u32) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            color,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        self.fields.push(EmbedField {
            name: name.into(),
            value: value.into(),
            inline,
        });
        self
    }
}

/// Interactive component row shown under a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Controls {
    #[default]
    None,
    StopGenerating,
    Settings,
    SettingsAndSave,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content: Option<String>,
    pub embed: Option<Embed>,
    pub attachments: Vec<Attachment>,
    pub controls: Controls,
    pub mention: Option<String>,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn embed(embed: Embed) -> Self {
        Self {
            embed: Some(embed),
            ..Self::default()
        }
    }

    pub fn mentioning(mut self, user_id: impl Into<String>) -> Self {
        self.mention = Some(user_id.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_controls(mut self, controls: Controls) -> Self {
        self.controls = controls;
        self
    }
}

/// Where results are rendered. Implementations own all platform specifics.
pub trait ChatSurface: Send + Sync {
    fn send(&self, channel: &str, message: OutgoingMessage) -> anyhow::Result<MessageRef>;

    /// Replaces the whole visible state of `target`.
    fn edit(&self, target: &MessageRef, message: OutgoingMessage) -> anyhow::Result<()>;

    fn delete(&self, target: &MessageRef) -> anyhow::Result<()>;

    /// Starts collecting a single "stop" action on `target` from `requester`
    /// for at most `window`.
    fn arm_cancel(&self, target: &MessageRef, requester: &str, window: Duration) -> CancelSignal;
}

/// Cooperative cancellation flag shared between a surface and a stream consumer.
///
/// Requests after the collection window has closed are ignored; once set the
/// flag never clears.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
    expires_at: Option<Instant>,
}

impl CancelSignal {
    pub fn armed(window: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            expires_at: Instant::now().checked_add(window),
        }
    }

    /// A signal nothing can fire.
    pub fn inert() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            expires_at: Some(Instant::now()),
        }
    }

    pub fn request(&self) -> bool {
        let open = self
            .expires_at
            .map(|deadline| Instant::now() < deadline)
            .unwrap_or(true);
        if open {
            self.flag.store(true, Ordering::SeqCst);
        }
        open
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::{Attachment, CancelSignal, Controls, Embed, OutgoingMessage};

    #[test]
    fn request_within_window_cancels_all_clones() {
        let signal = CancelSignal::armed(Duration::from_secs(300));
        let observer = signal.clone();
        assert!(!observer.is_cancelled());
        assert!(signal.request());
        assert!(observer.is_cancelled());
    }

    #[test]
    fn request_after_window_is_ignored() {
        let signal = CancelSignal::armed(Duration::from_millis(5));
        thread::sleep(Duration::from_millis(20));
        assert!(!signal.request());
        assert!(!signal.is_cancelled());
        assert!(!CancelSignal::inert().request());
    }

    #[test]
    fn message_builders_compose() {
        let message = OutgoingMessage::embed(
            Embed::new("Response", "body", 0x505050).field("Questioned by", "ada", false),
        )
        .mentioning("u-1")
        .with_attachment(Attachment::Text {
            name: "response.txt".to_string(),
            body: "full".to_string(),
        })
        .with_controls(Controls::Settings);
        assert!(message.content.is_none());
        assert_eq!(message.attachments[0].name(), "response.txt");
        assert_eq!(message.embed.unwrap().fields.len(), 1);
        assert_eq!(message.controls, Controls::Settings);
    }
}

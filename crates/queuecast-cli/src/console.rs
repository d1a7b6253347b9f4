use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use queuecast_contracts::surface::{
    Attachment, CancelSignal, ChatSurface, Controls, MessageRef, OutgoingMessage,
};

/// Frames remembered for incremental edits; older ones are reprinted in full.
const RENDERED_LIMIT: usize = 64;

/// One printed message: `head` holds everything but the streamed text.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    head: String,
    text: String,
}

/// Terminal rendering of the chat surface.
///
/// Edits that keep the head and only extend the text print the new suffix,
/// so a streamed reply reads like a live transcript. Text attachments are
/// written under `downloads`.
pub struct ConsoleSurface {
    downloads: PathBuf,
    next_id: Mutex<u64>,
    shown: Mutex<BTreeMap<u64, Frame>>,
    armed: Mutex<HashMap<String, CancelSignal>>,
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSurface {
    pub fn new(downloads: impl Into<PathBuf>) -> Self {
        Self::with_writer(downloads, Box::new(io::stdout()))
    }

    pub fn with_writer(downloads: impl Into<PathBuf>, out: Box<dyn Write + Send>) -> Self {
        Self {
            downloads: downloads.into(),
            next_id: Mutex::new(0),
            shown: Mutex::new(BTreeMap::new()),
            armed: Mutex::new(HashMap::new()),
            out: Mutex::new(out),
        }
    }

    /// Cancels the stream armed for `requester`; false when none is live.
    pub fn stop(&self, requester: &str) -> bool {
        lock(&self.armed)
            .remove(requester)
            .is_some_and(|signal| signal.request())
    }

    fn save_text(&self, name: &str, body: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.downloads)
            .with_context(|| format!("failed to create {}", self.downloads.display()))?;
        let path = self.downloads.join(name);
        fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    fn frame(&self, message: &OutgoingMessage) -> Frame {
        let mut head = Vec::new();
        if let Some(user) = &message.mention {
            head.push(format!("@{user}"));
        }
        match message.controls {
            Controls::None => {}
            Controls::StopGenerating => head.push("[/stop]".to_string()),
            Controls::Settings => head.push("[/settings]".to_string()),
            Controls::SettingsAndSave => head.push("[/settings] [/export]".to_string()),
        }
        let mut text = Vec::new();
        if let Some(content) = &message.content {
            text.push(content.clone());
        }
        if let Some(embed) = &message.embed {
            head.push(embed.title.clone());
            for field in &embed.fields {
                head.push(format!("{} {}", field.name, field.value));
            }
            text.push(embed.description.clone());
        }
        for attachment in &message.attachments {
            match attachment {
                Attachment::Url { url, name } => head.push(format!("📎 {name}: {url}")),
                Attachment::Text { name, body } => match self.save_text(name, body) {
                    Ok(path) => head.push(format!("📎 {name}: {}", path.display())),
                    Err(err) => head.push(format!("📎 {name}: not saved ({err:#})")),
                },
            }
        }
        Frame {
            head: head.join("\n"),
            text: text.join("\n"),
        }
    }

    fn print(&self, chunk: &str) -> Result<()> {
        let mut out = lock(&self.out);
        write!(out, "{chunk}")?;
        out.flush()?;
        Ok(())
    }

    fn remember(shown: &mut BTreeMap<u64, Frame>, id: u64, frame: Frame) {
        shown.insert(id, frame);
        while shown.len() > RENDERED_LIMIT {
            shown.pop_first();
        }
    }
}

fn full_print(frame: &Frame) -> String {
    if frame.head.is_empty() {
        format!("\n{}", frame.text)
    } else {
        format!("\n{}\n{}", frame.head, frame.text)
    }
}

impl ChatSurface for ConsoleSurface {
    fn send(&self, channel: &str, message: OutgoingMessage) -> Result<MessageRef> {
        let id = {
            let mut next = lock(&self.next_id);
            *next += 1;
            *next
        };
        let frame = self.frame(&message);
        let mut shown = lock(&self.shown);
        self.print(&full_print(&frame))?;
        Self::remember(&mut shown, id, frame);
        Ok(MessageRef {
            channel: channel.to_string(),
            id: id.to_string(),
        })
    }

    fn edit(&self, target: &MessageRef, message: OutgoingMessage) -> Result<()> {
        let frame = self.frame(&message);
        let mut shown = lock(&self.shown);
        let Ok(id) = target.id.parse::<u64>() else {
            return self.print(&full_print(&frame));
        };
        let suffix = shown
            .get(&id)
            .filter(|previous| previous.head == frame.head && !previous.text.is_empty())
            .and_then(|previous| frame.text.strip_prefix(previous.text.as_str()));
        match suffix {
            Some(suffix) => self.print(suffix)?,
            None => self.print(&full_print(&frame))?,
        }
        Self::remember(&mut shown, id, frame);
        Ok(())
    }

    fn delete(&self, target: &MessageRef) -> Result<()> {
        if let Ok(id) = target.id.parse::<u64>() {
            lock(&self.shown).remove(&id);
        }
        tracing::debug!(message = target.id.as_str(), "message removed");
        Ok(())
    }

    fn arm_cancel(&self, _target: &MessageRef, requester: &str, window: Duration) -> CancelSignal {
        let signal = CancelSignal::armed(window);
        lock(&self.armed).insert(requester.to_string(), signal.clone());
        signal
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

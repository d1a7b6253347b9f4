pub mod aggregator;
pub mod config;
pub mod conversation;
pub mod protocol;
pub mod retry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use queuecast_contracts::admission::AdmissionControl;
use queuecast_contracts::catalog::{BackendKind, BackendSelector, MediaKind, Resolution};
use queuecast_contracts::chat::{Intent, CHAT_HELP_COMMANDS};
use queuecast_contracts::events::{EventLog, EventPayload};
use queuecast_contracts::jobs::{GenerationJob, JobParams};
use queuecast_contracts::state::{BotState, Requester};
use queuecast_contracts::surface::{
    Attachment, ChatSurface, Controls, Embed, MessageRef, OutgoingMessage,
};
use serde_json::{json, Map, Value};

use crate::aggregator::{StreamAggregator, StreamOutcome, StreamTarget};
use crate::config::EngineConfig;
use crate::conversation::ConversationModel;
use crate::protocol::BackendRegistry;

pub const THINKING_NOTICE: &str = "> `Let me think...`";
pub const BUSY_NOTICE: &str = "> `Please wait until your previous action is complete.`";
pub const EMPTY_PROMPT_NOTICE: &str = "> `Please provide a valid prompt.`";
pub const BLOCKED_NOTICE: &str = "You are blacklisted and cannot use this bot.";
pub const GROUP_ONLY_NOTICE: &str = "This command cannot be used in DMs.";
pub const ADMIN_ONLY_NOTICE: &str = "You need to be an admin to use this command.";

const EMBED_COLOR: u32 = 0x505050;

/// One media generation request as typed by a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    pub media: MediaKind,
    pub prompt: String,
    /// Backend name asked for explicitly; `None` uses the user's preference.
    pub model: Option<String>,
    pub language: Option<String>,
}

impl MediaRequest {
    pub fn new(media: MediaKind, prompt: impl Into<String>) -> Self {
        Self {
            media,
            prompt: prompt.into(),
            model: None,
            language: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Blocked,
    Busy,
    EmptyPrompt,
}

impl Rejection {
    fn as_str(self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Busy => "busy",
            Self::EmptyPrompt => "empty_prompt",
        }
    }

    fn notice(self) -> &'static str {
        match self {
            Self::Blocked => BLOCKED_NOTICE,
            Self::Busy => BUSY_NOTICE,
            Self::EmptyPrompt => EMPTY_PROMPT_NOTICE,
        }
    }
}

#[derive(Debug)]
pub enum MediaOutcome {
    Delivered {
        job: GenerationJob,
        message: MessageRef,
        fallback_reason: Option<String>,
    },
    Failed {
        attempts: usize,
        error: String,
    },
    Rejected(Rejection),
}

#[derive(Debug)]
pub enum ChatOutcome {
    Streamed(StreamOutcome),
    Rejected(Rejection),
}

/// Routes chat requests to generation backends and the conversational model.
///
/// Safe to share across request threads; every mutable map lives in
/// [`BotState`] or [`AdmissionControl`].
pub struct Mediator {
    config: EngineConfig,
    state: Arc<BotState>,
    admission: Arc<AdmissionControl>,
    events: EventLog,
    backends: BackendRegistry,
    selector: BackendSelector,
    model: Box<dyn ConversationModel>,
    surface: Arc<dyn ChatSurface>,
}

impl Mediator {
    pub fn new(
        config: EngineConfig,
        state: Arc<BotState>,
        model: Box<dyn ConversationModel>,
        surface: Arc<dyn ChatSurface>,
    ) -> Self {
        let events = match &config.events_path {
            Some(path) => EventLog::new(path.clone(), uuid::Uuid::new_v4().to_string()),
            None => EventLog::disabled(),
        };
        Self {
            backends: BackendRegistry::hosted(&config),
            config,
            state,
            admission: AdmissionControl::new(),
            events,
            selector: BackendSelector::default(),
            model,
            surface,
        }
    }

    pub fn with_backends(mut self, backends: BackendRegistry) -> Self {
        self.backends = backends;
        self
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn state(&self) -> &Arc<BotState> {
        &self.state
    }

    pub fn admission(&self) -> &Arc<AdmissionControl> {
        &self.admission
    }

    pub fn events_path(&self) -> Option<PathBuf> {
        self.events.path().map(PathBuf::from)
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn generate_media(&self, requester: &Requester, request: MediaRequest) -> Result<MediaOutcome> {
        let media = request.media;
        let prompt = request.prompt.trim();
        if let Some(rejection) = self.precheck(requester, prompt) {
            self.reject(requester, media.as_str(), rejection)?;
            return Ok(MediaOutcome::Rejected(rejection));
        }
        let Ok(_guard) = self.admission.try_acquire(&requester.user_id) else {
            self.reject(requester, media.as_str(), Rejection::Busy)?;
            return Ok(MediaOutcome::Rejected(Rejection::Busy));
        };

        let preferences = self.state.preferences(&requester.user_id);
        let explicit = request.model.is_some();
        let preferred = match media {
            MediaKind::Image => Some(preferences.image_backend.as_str()),
            MediaKind::Speech => Some(preferences.speech_backend.as_str()),
            MediaKind::Music | MediaKind::Video => None,
        };
        let selection = self
            .selector
            .select_preferring(request.model.as_deref(), preferred, media)
            .map_err(|reason| anyhow!(reason))?;
        let kind = selection.backend.kind;
        let backend = self
            .backends
            .get(kind)
            .with_context(|| format!("no client registered for backend {kind}"))?;
        if let Some(reason) = &selection.fallback_reason {
            tracing::debug!(backend = kind.name(), "{reason}");
        }

        let mut params = JobParams::default().with_resolution(preferences.resolution);
        if media == MediaKind::Speech {
            params = params.with_language(request.language.as_deref().unwrap_or("English"));
        }
        self.record(
            "request_accepted",
            requester,
            json!({ "media": media.as_str(), "backend": kind.name(), "prompt": prompt }),
        );

        let progress = self.surface.send(
            &requester.channel_id,
            OutgoingMessage::text(progress_text(media, kind))
                .mentioning(requester.user_id.as_str()),
        )?;
        let result = self.config.retry_policy().run(|attempt| {
            tracing::debug!(attempt, backend = kind.name(), "submitting generation job");
            backend.submit(prompt, &params)
        });
        if let Err(err) = self.surface.delete(&progress) {
            tracing::warn!("failed to remove progress message: {err:#}");
        }

        match result {
            Ok(job) => {
                let locator = job.result_locator.clone().unwrap_or_default();
                let fallback_reason = selection.fallback_reason.filter(|_| explicit);
                let mut embed = Embed::new(
                    media_title(media),
                    format!(
                        "Here Is Your Generated {}:\n**Prompt:**\n```{prompt}```",
                        capitalized(media.as_str())
                    ),
                    EMBED_COLOR,
                )
                .field(
                    "**Generated by:**",
                    format!("`{}`", requester.display_name),
                    true,
                )
                .field("**Model Used:**", format!("`{}`", kind.name()), true);
                if let Some(language) = &job.params.language {
                    embed = embed.field("**Language Used:**", format!("`{language}`"), true);
                }
                if let Some(reason) = &fallback_reason {
                    embed = embed.field("**Note:**", reason.as_str(), false);
                }
                let message = self.surface.send(
                    &requester.channel_id,
                    OutgoingMessage::embed(embed)
                        .mentioning(requester.user_id.as_str())
                        .with_attachment(Attachment::Url {
                            url: locator.clone(),
                            name: media.attachment_name().to_string(),
                        })
                        .with_controls(Controls::Settings),
                )?;
                self.record(
                    "job_completed",
                    requester,
                    json!({
                        "media": media.as_str(),
                        "backend": kind.name(),
                        "token": job.correlation_token,
                        "locator": locator,
                    }),
                );
                Ok(MediaOutcome::Delivered {
                    job,
                    message,
                    fallback_reason,
                })
            }
            Err(exhausted) => {
                self.record(
                    "job_failed",
                    requester,
                    json!({
                        "media": media.as_str(),
                        "backend": kind.name(),
                        "attempts": exhausted.attempts,
                        "error": exhausted.last.to_string(),
                    }),
                );
                self.surface.send(
                    &requester.channel_id,
                    OutgoingMessage::text(format!(
                        "Sorry, could not generate the {media}. Please try again later."
                    ))
                    .mentioning(requester.user_id.as_str()),
                )?;
                Ok(MediaOutcome::Failed {
                    attempts: exhausted.attempts,
                    error: exhausted.last.to_string(),
                })
            }
        }
    }

    /// Streams one conversational reply and persists the exchange on success.
    pub fn converse(&self, requester: &Requester, text: &str) -> Result<ChatOutcome> {
        let prompt = text.trim();
        if let Some(rejection) = self.precheck(requester, prompt) {
            self.reject(requester, "chat", rejection)?;
            return Ok(ChatOutcome::Rejected(rejection));
        }
        let Ok(_guard) = self.admission.try_acquire(&requester.user_id) else {
            self.reject(requester, "chat", Rejection::Busy)?;
            return Ok(ChatOutcome::Rejected(Rejection::Busy));
        };

        let key = self.state.history_key(requester);
        let history = self.state.history().get(&key);
        let framed = match self.state.instructions_for(requester) {
            Some(instructions) => {
                format!("[Instructions To Follow]: {instructions}\n\n<=====>\n{prompt}")
            }
            None => prompt.to_string(),
        };
        let url_reading = self.state.preferences(&requester.user_id).url_reading;
        self.record(
            "request_accepted",
            requester,
            json!({
                "media": "chat",
                "model": self.model.name(),
                "history_key": key,
                "url_reading": url_reading,
            }),
        );

        let thinking = self.surface.send(
            &requester.channel_id,
            OutgoingMessage::text(THINKING_NOTICE).with_controls(Controls::StopGenerating),
        )?;
        let cancel = self
            .surface
            .arm_cancel(&thinking, &requester.user_id, self.config.cancel_window);
        let target = StreamTarget {
            surface: Arc::clone(&self.surface),
            message: thinking,
            requester: requester.clone(),
            style: self.state.response_style(requester),
            cancel,
            save_button: self.save_button(requester),
        };
        let aggregator =
            StreamAggregator::new(self.config.edit_interval, self.config.stream_retry_policy());
        let outcome = aggregator.run(&target, || self.model.open_stream(&history, &framed));

        match &outcome {
            StreamOutcome::Completed {
                text,
                overflowed,
                attempts,
            } => {
                self.state.history().append(&key, prompt, text);
                if let Err(err) = self.state.save() {
                    tracing::warn!("failed to save state: {err:#}");
                }
                self.record(
                    "stream_completed",
                    requester,
                    json!({
                        "history_key": key,
                        "chars": text.chars().count(),
                        "overflowed": overflowed,
                        "attempts": attempts,
                    }),
                );
            }
            StreamOutcome::Cancelled => {
                self.record("stream_cancelled", requester, json!({ "history_key": key }));
            }
            StreamOutcome::Failed(exhausted) => {
                self.record(
                    "stream_failed",
                    requester,
                    json!({ "attempts": exhausted.attempts, "error": format!("{:#}", exhausted.last) }),
                );
            }
        }
        Ok(ChatOutcome::Streamed(outcome))
    }

    pub fn clear_history(&self, requester: &Requester) -> String {
        if self.group_history_active(requester) {
            return "Clearing chat history is not enabled for this server, Server-Wide chat history is active."
                .to_string();
        }
        self.state.history().clear(&requester.user_id);
        self.persist();
        "> `Chat history cleared!`".to_string()
    }

    pub fn clear_group_history(&self, requester: &Requester) -> String {
        let group = match self.admin_group(requester) {
            Ok(group) => group,
            Err(notice) => return notice.to_string(),
        };
        if !self.state.group_settings(group).group_history {
            return "Server-Wide Chat History Is Disabled For This Server.".to_string();
        }
        self.state.history().clear(group);
        self.persist();
        "Server-Wide Chat History Cleared!".to_string()
    }

    /// Stores the image backend, dropping back to Square when it lacks the
    /// current resolution.
    pub fn select_image_model(&self, requester: &Requester, name: &str) -> String {
        let Some(kind) = BackendKind::from_name(name).filter(|kind| kind.media() == MediaKind::Image)
        else {
            return format!(
                "> `Unknown image model '{}'.` Available: {}",
                name.trim(),
                backend_names(MediaKind::Image)
            );
        };
        let mut reset = false;
        self.state.update_preferences(&requester.user_id, |prefs| {
            prefs.image_backend = kind.name().to_string();
            if !kind.resolutions().supports(prefs.resolution) {
                prefs.resolution = Resolution::Square;
                reset = true;
            }
        });
        self.persist();
        let mut reply = format!("**Image Generation Model Selected**: {}", kind.name());
        if reset {
            reply.push_str("\n> `Resolution reset to Square.`");
        }
        reply
    }

    pub fn select_resolution(&self, requester: &Requester, raw: &str) -> String {
        let Some(resolution) = Resolution::parse(raw) else {
            return format!(
                "> `Unknown resolution '{}'.` Available: Square, Wide, Portrait",
                raw.trim()
            );
        };
        let current = self.image_backend(requester);
        let pinned = current.resolutions().pin(resolution);
        self.state
            .update_preferences(&requester.user_id, |prefs| prefs.resolution = pinned);
        self.persist();
        if pinned != resolution {
            return format!(
                "**Image Generation Resolution Selected**: {pinned}\n> **Supported Models:** {}",
                wide_capable_models()
            );
        }
        format!("**Image Generation Resolution Selected**: {pinned}")
    }

    pub fn select_speech_model(&self, requester: &Requester, name: &str) -> String {
        let Some(kind) = BackendKind::from_name(name).filter(|kind| kind.media() == MediaKind::Speech)
        else {
            return format!(
                "> `Unknown speech model '{}'.` Available: {}",
                name.trim(),
                backend_names(MediaKind::Speech)
            );
        };
        self.state.update_preferences(&requester.user_id, |prefs| {
            prefs.speech_backend = kind.name().to_string();
        });
        self.persist();
        format!("**Speech Generation Model Selected**: {}", kind.name())
    }

    /// Flips the style that currently applies to `requester`: the group's
    /// when it enforces one, the user's own otherwise.
    pub fn toggle_response_style(&self, requester: &Requester) -> String {
        let enforced_group = requester
            .group_id
            .as_deref()
            .filter(|group| self.state.group_settings(group).group_response_preference);
        if enforced_group.is_some() && !requester.is_admin {
            return ADMIN_ONLY_NOTICE.to_string();
        }
        let style = match enforced_group {
            Some(group) => {
                self.state
                    .update_group(group, |settings| {
                        settings.response_style = settings.response_style.toggled();
                    })
                    .response_style
            }
            None => {
                self.state
                    .update_preferences(&requester.user_id, |prefs| {
                        prefs.response_style = prefs.response_style.toggled();
                    })
                    .response_style
            }
        };
        self.persist();
        match enforced_group {
            Some(_) => format!("Server response style updated to: {}", style.as_str()),
            None => format!("Response style updated to: {}", style.as_str()),
        }
    }

    /// Flips the per-user URL-reading flag. The flag is recorded with every
    /// chat request for the link-fetching stage in front of the model.
    pub fn toggle_url_reading(&self, requester: &Requester) -> String {
        let enabled = self
            .state
            .update_preferences(&requester.user_id, |prefs| {
                prefs.url_reading = !prefs.url_reading;
            })
            .url_reading;
        self.persist();
        format!("URL reading is now `{}`", if enabled { "ON" } else { "OFF" })
    }

    pub fn set_instructions(&self, requester: &Requester, text: &str) -> String {
        let text = text.trim();
        if text.is_empty() {
            return "> `Please provide the instructions to follow.`".to_string();
        }
        let (key, reply) = match self.group_personality(requester) {
            Some(_) if !requester.is_admin => return ADMIN_ONLY_NOTICE.to_string(),
            Some(group) => (group, "Custom Server Personality Instructions Saved!"),
            None => (
                requester.user_id.clone(),
                "> Custom Personality Instructions Saved!",
            ),
        };
        self.state.set_instructions(&key, text);
        self.persist();
        reply.to_string()
    }

    pub fn remove_instructions(&self, requester: &Requester) -> String {
        let key = match self.group_personality(requester) {
            Some(_) if !requester.is_admin => return ADMIN_ONLY_NOTICE.to_string(),
            Some(group) => group,
            None => requester.user_id.clone(),
        };
        if !self.state.remove_instructions(&key) {
            return "> `No custom instructions were set.`".to_string();
        }
        self.persist();
        "> `Custom personality instructions removed.`".to_string()
    }

    pub fn toggle_group_setting(&self, requester: &Requester, setting: &str) -> String {
        let group = match self.admin_group(requester) {
            Ok(group) => group,
            Err(notice) => return notice.to_string(),
        };
        let mut label = "";
        let mut value = false;
        self.state.update_group(group, |settings| {
            let (name, flag) = match setting {
                "group_history" => ("Chat History", &mut settings.group_history),
                "group_save_button" => (
                    "\"Settings And Save Button\"",
                    &mut settings.settings_save_button,
                ),
                "group_personality" => ("Personality", &mut settings.custom_group_personality),
                "group_response_preference" => (
                    "Response Following",
                    &mut settings.group_response_preference,
                ),
                _ => return,
            };
            *flag = !*flag;
            label = name;
            value = *flag;
        });
        if label.is_empty() {
            return format!("> `Unknown group setting '{setting}'.`");
        }
        self.persist();
        format!("Server-wide {label} Is Now `{value}`")
    }

    /// Switches the requester's channel between answering every message and
    /// answering only when addressed.
    pub fn toggle_respond_all(&self, requester: &Requester) -> String {
        if let Err(notice) = self.admin_group(requester) {
            return notice.to_string();
        }
        let enabled = self.state.toggle_respond_all(&requester.channel_id);
        self.persist();
        if enabled {
            "> **The bot will now respond** to all messages in this channel.".to_string()
        } else {
            "> **The bot will now stop** responding to all messages in this channel.".to_string()
        }
    }

    /// Lets one member get replies in this channel without mentioning the bot.
    pub fn toggle_always_respond(&self, requester: &Requester) -> String {
        if requester.group_id.is_none() {
            return "> `This feature is disabled in DMs.`".to_string();
        }
        let enabled = self
            .state
            .toggle_always_respond(&requester.channel_id, &requester.user_id);
        self.persist();
        format!(
            "> Bot response to your messages is turned `{}`.",
            if enabled { "ON" } else { "OFF" }
        )
    }

    /// Whether a free-text message should get an answer at all.
    pub fn should_respond(&self, requester: &Requester, mentioned: bool) -> bool {
        self.state.should_respond(requester, mentioned)
    }

    pub fn block_user(&self, requester: &Requester, user: &str) -> String {
        self.edit_blocklist(requester, user, true)
    }

    pub fn unblock_user(&self, requester: &Requester, user: &str) -> String {
        self.edit_blocklist(requester, user, false)
    }

    fn edit_blocklist(&self, requester: &Requester, user: &str, block: bool) -> String {
        let group = match self.admin_group(requester) {
            Ok(group) => group,
            Err(notice) => return notice.to_string(),
        };
        let user = user.trim().trim_start_matches('@');
        if user.is_empty() {
            return "> `Please name a user.`".to_string();
        }
        let changed = if block {
            self.state.block(group, user)
        } else {
            self.state.unblock(group, user)
        };
        if changed {
            self.persist();
        }
        match (block, changed) {
            (true, true) => format!("User {user} has been blacklisted."),
            (true, false) => format!("User {user} is already blacklisted."),
            (false, true) => format!("User {user} has been removed from the blacklist."),
            (false, false) => format!("User {user} is not in the blacklist."),
        }
    }

    /// Sends the active history as a text attachment.
    pub fn export_conversation(&self, requester: &Requester, format: &str) -> Result<()> {
        if !format.eq_ignore_ascii_case("txt") {
            return self.reply(
                requester,
                format!("> `Unsupported export format '{format}'. Use txt.`"),
            );
        }
        let key = self.state.history_key(requester);
        let Some(transcript) = self.state.history().transcript(&key) else {
            return self.reply(requester, "> `No conversation history found.`");
        };
        let heading = if key == requester.user_id {
            "> `Here's your conversation history:`"
        } else {
            "> `Here's The Server-Wide conversation history:`"
        };
        self.surface.send(
            &requester.channel_id,
            OutgoingMessage::text(heading).with_attachment(Attachment::Text {
                name: "conversation_history.txt".to_string(),
                body: transcript,
            }),
        )?;
        Ok(())
    }

    pub fn settings_embed(&self, requester: &Requester) -> Embed {
        let prefs = self.state.preferences(&requester.user_id);
        let mut embed = Embed::new(
            "⚙️ **Settings**",
            format!("Settings for `{}`", requester.display_name),
            EMBED_COLOR,
        )
        .field("**Image Model:**", format!("`{}`", prefs.image_backend), true)
        .field("**Resolution:**", format!("`{}`", prefs.resolution), true)
        .field("**Speech Model:**", format!("`{}`", prefs.speech_backend), true)
        .field(
            "**Response Style:**",
            format!("`{}`", self.state.response_style(requester).as_str()),
            true,
        )
        .field("**URL Reading:**", format!("`{}`", prefs.url_reading), true)
        .field("**Chat Model:**", format!("`{}`", self.model.name()), true);
        if let Some(group) = &requester.group_id {
            let settings = self.state.group_settings(group);
            embed = embed
                .field("**Server-Wide History:**", format!("`{}`", settings.group_history), true)
                .field(
                    "**Server-Wide Personality:**",
                    format!("`{}`", settings.custom_group_personality),
                    true,
                )
                .field(
                    "**Server Response Following:**",
                    format!("`{}`", settings.group_response_preference),
                    true,
                );
        }
        embed
    }

    /// Runs one parsed intent and posts its reply to the requester's channel.
    ///
    /// `stop` is not handled here; it needs the cancel signal held by the
    /// surface.
    pub fn dispatch(&self, requester: &Requester, intent: &Intent) -> Result<()> {
        let prompt = intent.prompt.clone().unwrap_or_default();
        let model = intent.arg("model").map(str::to_string);
        let free_text = matches!(intent.action.as_str(), "chat" | "generate_image");
        if free_text && !intent.slash_command && !self.should_respond(requester, intent.mentioned) {
            self.record("message_ignored", requester, json!({ "action": intent.action }));
            return Ok(());
        }
        match intent.action.as_str() {
            "noop" | "stop" => Ok(()),
            "chat" => self.converse(requester, &prompt).map(|_| ()),
            "generate_image" => self.run_media(
                requester,
                MediaRequest::new(MediaKind::Image, prompt).with_model(model),
            ),
            "generate_music" => self.run_media(
                requester,
                MediaRequest::new(MediaKind::Music, prompt).with_model(model),
            ),
            "generate_video" => self.run_media(
                requester,
                MediaRequest::new(MediaKind::Video, prompt).with_model(model),
            ),
            "generate_speech" => self.run_media(
                requester,
                MediaRequest::new(MediaKind::Speech, prompt)
                    .with_language(intent.arg("language").unwrap_or("English")),
            ),
            "set_image_model" => {
                let reply =
                    self.select_image_model(requester, intent.arg("model").unwrap_or_default());
                self.reply(requester, reply)
            }
            "set_speech_model" => {
                let reply =
                    self.select_speech_model(requester, intent.arg("model").unwrap_or_default());
                self.reply(requester, reply)
            }
            "set_resolution" => {
                let reply =
                    self.select_resolution(requester, intent.arg("resolution").unwrap_or_default());
                self.reply(requester, reply)
            }
            "set_instructions" => {
                let reply =
                    self.set_instructions(requester, intent.arg("text").unwrap_or_default());
                self.reply(requester, reply)
            }
            "remove_instructions" => self.reply(requester, self.remove_instructions(requester)),
            "clear_history" => self.reply(requester, self.clear_history(requester)),
            "clear_group_history" => self.reply(requester, self.clear_group_history(requester)),
            "toggle_response_style" => self.reply(requester, self.toggle_response_style(requester)),
            "toggle_url_reading" => self.reply(requester, self.toggle_url_reading(requester)),
            "toggle_group_setting" => {
                let setting = intent
                    .settings_update
                    .get("group_setting")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.reply(requester, self.toggle_group_setting(requester, setting))
            }
            "block_user" => self.reply(
                requester,
                self.block_user(requester, intent.arg("user").unwrap_or_default()),
            ),
            "unblock_user" => self.reply(
                requester,
                self.unblock_user(requester, intent.arg("user").unwrap_or_default()),
            ),
            "toggle_respond_all" => self.reply(requester, self.toggle_respond_all(requester)),
            "toggle_always_respond" => {
                self.reply(requester, self.toggle_always_respond(requester))
            }
            "export_conversation" => {
                self.export_conversation(requester, intent.arg("format").unwrap_or("txt"))
            }
            "show_settings" => {
                let message = OutgoingMessage::embed(self.settings_embed(requester))
                    .with_controls(Controls::Settings);
                self.surface.send(&requester.channel_id, message)?;
                Ok(())
            }
            "help" => self.reply(requester, help_text()),
            "unknown" => self.reply(
                requester,
                format!(
                    "> `Unknown command /{}. Try /help.`",
                    intent.arg("command").unwrap_or_default()
                ),
            ),
            other => Err(anyhow!("unhandled intent action '{other}'")),
        }
    }

    fn run_media(&self, requester: &Requester, request: MediaRequest) -> Result<()> {
        self.generate_media(requester, request).map(|_| ())
    }

    fn precheck(&self, requester: &Requester, prompt: &str) -> Option<Rejection> {
        if self.state.is_blocked(requester) {
            return Some(Rejection::Blocked);
        }
        if prompt.is_empty() {
            return Some(Rejection::EmptyPrompt);
        }
        None
    }

    fn reject(&self, requester: &Requester, media: &str, rejection: Rejection) -> Result<()> {
        self.record(
            "request_rejected",
            requester,
            json!({ "media": media, "reason": rejection.as_str() }),
        );
        self.surface.send(
            &requester.channel_id,
            OutgoingMessage::text(rejection.notice()).mentioning(requester.user_id.as_str()),
        )?;
        Ok(())
    }

    fn reply(&self, requester: &Requester, text: impl Into<String>) -> Result<()> {
        self.surface
            .send(&requester.channel_id, OutgoingMessage::text(text))?;
        Ok(())
    }

    fn record(&self, event_type: &str, requester: &Requester, fields: Value) {
        let mut payload = map_object(json!({
            "user_id": requester.user_id,
            "group_id": requester.group_id,
            "channel_id": requester.channel_id,
        }));
        payload.extend(map_object(fields));
        self.events.record(event_type, payload);
    }

    fn persist(&self) {
        if let Err(err) = self.state.save() {
            tracing::warn!("failed to save state: {err:#}");
        }
    }

    fn image_backend(&self, requester: &Requester) -> BackendKind {
        BackendKind::from_name(&self.state.preferences(&requester.user_id).image_backend)
            .filter(|kind| kind.media() == MediaKind::Image)
            .unwrap_or(BackendKind::SdxlTcd)
    }

    fn group_history_active(&self, requester: &Requester) -> bool {
        requester
            .group_id
            .as_deref()
            .is_some_and(|group| self.state.group_settings(group).group_history)
    }

    fn group_personality(&self, requester: &Requester) -> Option<String> {
        requester
            .group_id
            .clone()
            .filter(|group| self.state.group_settings(group).custom_group_personality)
    }

    fn save_button(&self, requester: &Requester) -> bool {
        requester
            .group_id
            .as_deref()
            .is_some_and(|group| self.state.group_settings(group).settings_save_button)
    }

    /// The requester's group, provided they administer it.
    fn admin_group<'a>(&self, requester: &'a Requester) -> Result<&'a str, &'static str> {
        let group = requester.group_id.as_deref().ok_or(GROUP_ONLY_NOTICE)?;
        if !requester.is_admin {
            return Err(ADMIN_ONLY_NOTICE);
        }
        Ok(group)
    }
}

fn map_object(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn progress_text(media: MediaKind, kind: BackendKind) -> String {
    match media {
        MediaKind::Image => format!("Generating your image with {kind}, please wait... 🖌️"),
        MediaKind::Speech => "Generating your speech, please wait... 💽".to_string(),
        MediaKind::Music => "Generating your music, please wait... 🎧".to_string(),
        MediaKind::Video => "Generating your video, please wait... 📽️".to_string(),
    }
}

fn media_title(media: MediaKind) -> &'static str {
    match media {
        MediaKind::Image => "✨ **Image Generated!**",
        MediaKind::Speech => "🎙️ **Speech Generated!**",
        MediaKind::Music => "🎶 **Music Generated!**",
        MediaKind::Video => "🎥 **Video Generated!**",
    }
}

fn capitalized(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn backend_names(media: MediaKind) -> String {
    BackendKind::ALL
        .into_iter()
        .filter(|kind| kind.media() == media)
        .map(|kind| format!("`{}`", kind.name()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn wide_capable_models() -> String {
    BackendKind::ALL
        .into_iter()
        .filter(|kind| kind.resolutions().supports(Resolution::Wide))
        .map(|kind| format!("`{}`", kind.name()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn help_text() -> String {
    let mut text = String::from("> **Commands**\n");
    for command in CHAT_HELP_COMMANDS {
        text.push_str(&format!("> `{command}`\n"));
    }
    text
}

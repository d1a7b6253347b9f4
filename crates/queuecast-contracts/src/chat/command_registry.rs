#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

/// Commands whose whole remainder is a single free-text value.
pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "image_model",
        action: "set_image_model",
    },
    CommandSpec {
        command: "speech_model",
        action: "set_speech_model",
    },
    CommandSpec {
        command: "resolution",
        action: "set_resolution",
    },
    CommandSpec {
        command: "instructions",
        action: "set_instructions",
    },
];

/// Commands taking an optional `model=NAME` head followed by a prompt.
pub(crate) const MEDIA_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "imagine",
        action: "generate_image",
    },
    CommandSpec {
        command: "music",
        action: "generate_music",
    },
    CommandSpec {
        command: "video",
        action: "generate_video",
    },
];

pub(crate) const SPEECH_COMMAND: CommandSpec = CommandSpec {
    command: "speech",
    action: "generate_speech",
};

pub(crate) const SPEECH_LANGUAGES: &[&str] =
    &["English", "Spanish", "French", "Chinese", "Korean", "Japanese"];

pub(crate) const GROUP_TOGGLE_COMMANDS: &[&str] = &[
    "group_history",
    "group_save_button",
    "group_personality",
    "group_response_preference",
];

pub(crate) const USER_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "block",
        action: "block_user",
    },
    CommandSpec {
        command: "unblock",
        action: "unblock_user",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "clear",
        action: "clear_history",
    },
    CommandSpec {
        command: "clear_group_history",
        action: "clear_group_history",
    },
    CommandSpec {
        command: "stop",
        action: "stop",
    },
    CommandSpec {
        command: "style",
        action: "toggle_response_style",
    },
    CommandSpec {
        command: "url",
        action: "toggle_url_reading",
    },
    CommandSpec {
        command: "forget_instructions",
        action: "remove_instructions",
    },
    CommandSpec {
        command: "settings",
        action: "show_settings",
    },
    CommandSpec {
        command: "respondtoall",
        action: "toggle_respond_all",
    },
    CommandSpec {
        command: "alwaysrespond",
        action: "toggle_always_respond",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
];

pub(crate) const EXPORT_COMMAND: CommandSpec = CommandSpec {
    command: "export",
    action: "export_conversation",
};

/// Group messages opening with this are addressed to the bot.
pub(crate) const BOT_MENTION: &str = "@queuecast";

/// Plain messages starting with one of these words request an image.
pub(crate) const IMAGE_TRIGGER_WORDS: &[&str] = &["generate", "imagine"];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/imagine [model=NAME] <prompt>",
    "/speech [language] <prompt>",
    "/music <prompt>",
    "/video <prompt>",
    "/image_model <name>",
    "/speech_model <name>",
    "/resolution <square|wide|portrait>",
    "/style",
    "/url",
    "/instructions <text>",
    "/forget_instructions",
    "/clear",
    "/stop",
    "/export",
    "/settings",
    "/group_history",
    "/group_save_button",
    "/group_personality",
    "/group_response_preference",
    "/clear_group_history",
    "/block <user>",
    "/unblock <user>",
    "/respondtoall",
    "/alwaysrespond",
    "/help",
];

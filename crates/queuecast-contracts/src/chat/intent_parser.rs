use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, BOT_MENTION, EXPORT_COMMAND, GROUP_TOGGLE_COMMANDS, IMAGE_TRIGGER_WORDS,
    MEDIA_COMMANDS, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SPEECH_COMMAND, SPEECH_LANGUAGES, USER_ARG_COMMANDS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub settings_update: BTreeMap<String, Value>,
    pub command_args: BTreeMap<String, Value>,
    /// The line opened with a mention of the bot.
    pub mentioned: bool,
    /// Parsed from a `/command` rather than from free text.
    pub slash_command: bool,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            settings_update: BTreeMap::new(),
            command_args: BTreeMap::new(),
            mentioned: false,
            slash_command: false,
        }
    }

    fn with_prompt(mut self, prompt: &str) -> Self {
        let prompt = prompt.trim();
        if !prompt.is_empty() {
            self.prompt = Some(prompt.to_string());
        }
        self
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.command_args.get(key).and_then(Value::as_str)
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn split_words(arg: &str) -> Vec<String> {
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg.split_whitespace().map(str::to_string).collect(),
    }
}

/// Splits a leading `model=NAME` (quotes allowed) from the prompt.
fn parse_model_prefix(arg: &str) -> (Option<String>, String) {
    let trimmed = arg.trim();
    let Some(tail) = trimmed.strip_prefix("model=") else {
        return (None, trimmed.to_string());
    };
    let head_len = if tail.starts_with('"') || tail.starts_with('\'') {
        let quote = tail.chars().next().unwrap_or('"');
        tail[1..].find(quote).map(|end| end + 2).unwrap_or(tail.len())
    } else {
        tail.find(char::is_whitespace).unwrap_or(tail.len())
    };
    let model = split_words(&tail[..head_len]).join(" ");
    let prompt = tail[head_len..].trim().to_string();
    ((!model.is_empty()).then_some(model), prompt)
}

fn parse_speech_args(arg: &str) -> (Option<&'static str>, String) {
    let trimmed = arg.trim();
    let head = trimmed.split_whitespace().next().unwrap_or_default();
    match SPEECH_LANGUAGES
        .iter()
        .find(|language| language.eq_ignore_ascii_case(head))
    {
        Some(language) => (Some(*language), trimmed[head.len()..].trim().to_string()),
        None => (None, trimmed.to_string()),
    }
}

fn image_trigger(text: &str) -> Option<&str> {
    let lower = text.to_ascii_lowercase();
    IMAGE_TRIGGER_WORDS
        .iter()
        .find(|word| lower.starts_with(*word))
        .map(|word| text[word.len()..].trim())
}

/// Strips a leading `@queuecast` mention.
fn strip_mention(text: &str) -> (bool, &str) {
    let Some(head) = text.get(..BOT_MENTION.len()) else {
        return (false, text);
    };
    let tail = &text[BOT_MENTION.len()..];
    let separated = tail
        .chars()
        .next()
        .map_or(true, |ch| ch.is_whitespace() || ch == ',' || ch == ':');
    if head.eq_ignore_ascii_case(BOT_MENTION) && separated {
        (true, tail.trim_start_matches([',', ':']).trim())
    } else {
        (false, text)
    }
}

pub fn parse_intent(text: &str) -> Intent {
    let (mentioned, body) = strip_mention(text.trim());
    let mut intent = parse_body(text, body);
    intent.mentioned = mentioned;
    intent.slash_command = body.starts_with('/') && intent.action != "chat";
    intent
}

fn parse_body(text: &str, raw_trimmed: &str) -> Intent {
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some(action) = find_action(&command, RAW_ARG_COMMANDS) {
                let key = match action {
                    "set_resolution" => "resolution",
                    "set_instructions" => "text",
                    _ => "model",
                };
                let mut intent = Intent::new(action, text);
                intent
                    .command_args
                    .insert(key.to_string(), Value::String(arg.to_string()));
                return intent;
            }

            if let Some(action) = find_action(&command, MEDIA_COMMANDS) {
                let (model, prompt) = parse_model_prefix(arg);
                let mut intent = Intent::new(action, text).with_prompt(&prompt);
                intent.command_args.insert(
                    "model".to_string(),
                    model.map(Value::String).unwrap_or(Value::Null),
                );
                return intent;
            }

            if command == SPEECH_COMMAND.command {
                let (language, prompt) = parse_speech_args(arg);
                let mut intent = Intent::new(SPEECH_COMMAND.action, text).with_prompt(&prompt);
                intent.command_args.insert(
                    "language".to_string(),
                    Value::String(language.unwrap_or("English").to_string()),
                );
                return intent;
            }

            if GROUP_TOGGLE_COMMANDS.iter().any(|value| *value == command) {
                let mut intent = Intent::new("toggle_group_setting", text);
                intent
                    .settings_update
                    .insert("group_setting".to_string(), Value::String(command));
                return intent;
            }

            if let Some(action) = find_action(&command, USER_ARG_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    "user".to_string(),
                    Value::String(split_words(arg).join(" ")),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            if command == EXPORT_COMMAND.command {
                let mut intent = Intent::new(EXPORT_COMMAND.action, text);
                intent.command_args.insert(
                    "format".to_string(),
                    Value::String(if arg.is_empty() {
                        "txt".to_string()
                    } else {
                        arg.to_ascii_lowercase()
                    }),
                );
                return intent;
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    if let Some(prompt) = image_trigger(raw_trimmed) {
        let mut intent = Intent::new("generate_image", text).with_prompt(prompt);
        intent.command_args.insert("model".to_string(), Value::Null);
        return intent;
    }

    Intent::new("chat", text).with_prompt(raw_trimmed)
}

use std::io::{BufRead, BufReader};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use queuecast_contracts::history::Utterance;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use crate::config::EngineConfig;

/// Text fragments in arrival order; an `Err` item ends the stream.
pub type FragmentStream = Box<dyn Iterator<Item = Result<String>> + Send>;

pub trait ConversationModel: Send + Sync {
    fn name(&self) -> &str;
    fn open_stream(&self, history: &[Utterance], prompt: &str) -> Result<FragmentStream>;
}

const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

pub struct GeminiModel {
    api_base: String,
    api_key: String,
    model: String,
    safety_threshold: String,
    http: HttpClient,
}

impl GeminiModel {
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let Some(api_key) = config.gemini_api_key.clone() else {
            bail!("GEMINI_API_KEY (or GOOGLE_API_KEY) is not set");
        };
        Ok(Self {
            api_base: config.gemini_api_base.clone(),
            api_key,
            model: config.chat_model.clone(),
            safety_threshold: config.safety_threshold.clone(),
            http: HttpClient::new(),
        })
    }

    fn endpoint(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:streamGenerateContent", self.api_base, model_path)
    }

    fn build_payload(&self, history: &[Utterance], prompt: &str) -> Value {
        let mut contents: Vec<Value> = history
            .iter()
            .map(|utterance| {
                json!({
                    "role": utterance.role.as_str(),
                    "parts": [{ "text": utterance.text }],
                })
            })
            .collect();
        contents.push(json!({ "role": "user", "parts": [{ "text": prompt }] }));
        let safety: Vec<Value> = HARM_CATEGORIES
            .iter()
            .map(|category| json!({ "category": category, "threshold": self.safety_threshold }))
            .collect();
        json!({ "contents": contents, "safetySettings": safety })
    }
}

impl ConversationModel for GeminiModel {
    fn name(&self) -> &str {
        &self.model
    }

    fn open_stream(&self, history: &[Utterance], prompt: &str) -> Result<FragmentStream> {
        let endpoint = self.endpoint();
        let response = self
            .http
            .post(&endpoint)
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
            .json(&self.build_payload(history, prompt))
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "Gemini request failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }
        Ok(Box::new(SseFragments::new(BufReader::new(response))))
    }
}

/// Decodes `data:` lines of a streamed `generateContent` response.
pub struct SseFragments<R> {
    reader: R,
    done: bool,
}

impl<R: BufRead> SseFragments<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for SseFragments<R> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => self.done = true,
                Ok(_) => {
                    let Some(data) = line.trim().strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        self.done = true;
                        continue;
                    }
                    match decode_chunk(data) {
                        Ok(Some(text)) => return Some(Ok(text)),
                        Ok(None) => continue,
                        Err(err) => {
                            self.done = true;
                            return Some(Err(err));
                        }
                    }
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(anyhow::Error::new(err).context("response stream broke")));
                }
            }
        }
        None
    }
}

fn decode_chunk(data: &str) -> Result<Option<String>> {
    let payload: Value =
        serde_json::from_str(data).context("Gemini stream chunk is not valid JSON")?;
    if let Some(error) = payload.get("error") {
        bail!(
            "Gemini stream error: {}",
            error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
        );
    }
    if let Some(reason) = payload
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)
    {
        bail!("response was blocked: {reason}");
    }
    let text: String = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    Ok((!text.is_empty()).then_some(text))
}

fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

/// Offline model: replays fixed fragments with an optional pause between them.
#[derive(Debug, Clone, Default)]
pub struct DryrunModel {
    fragments: Option<Vec<String>>,
    delay: Duration,
}

impl DryrunModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fragments<I, S>(mut self, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fragments = Some(fragments.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl ConversationModel for DryrunModel {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn open_stream(&self, history: &[Utterance], prompt: &str) -> Result<FragmentStream> {
        let fragments = self.fragments.clone().unwrap_or_else(|| {
            let reply = format!(
                "Dryrun reply #{} to: {}",
                history.len() / 2 + 1,
                prompt.trim()
            );
            reply
                .split_inclusive(' ')
                .map(str::to_string)
                .collect()
        });
        let delay = self.delay;
        Ok(Box::new(fragments.into_iter().map(move |fragment| {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            Ok(fragment)
        })))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use queuecast_contracts::history::{Role, Utterance};
    use serde_json::json;

    use super::{ConversationModel, DryrunModel, GeminiModel, SseFragments};
    use crate::config::EngineConfig;

    fn fragments(body: &str) -> Vec<anyhow::Result<String>> {
        SseFragments::new(Cursor::new(body.as_bytes().to_vec())).collect()
    }

    #[test]
    fn sse_lines_decode_to_text() {
        let body = concat!(
            "data: {\"candidates\": [{\"content\": {\"parts\": [{\"text\": \"Hel\"}], \"role\": \"model\"}}]}\r\n",
            "\r\n",
            "data: {\"candidates\": [{\"content\": {\"parts\": [{\"text\": \"lo\"}, {\"text\": \"!\"}]}}]}\r\n",
            "\r\n",
            "data: {\"candidates\": [{\"finishReason\": \"STOP\"}]}\r\n",
        );
        let texts: Vec<String> = fragments(body).into_iter().map(|item| item.unwrap()).collect();
        assert_eq!(texts, vec!["Hel".to_string(), "lo!".to_string()]);
    }

    #[test]
    fn blocked_prompt_is_an_error_item() {
        let body = "data: {\"promptFeedback\": {\"blockReason\": \"SAFETY\"}}\n";
        let items = fragments(body);
        assert_eq!(items.len(), 1);
        assert!(items[0].as_ref().unwrap_err().to_string().contains("SAFETY"));
    }

    #[test]
    fn invalid_chunk_ends_stream() {
        let body = "data: {\"candidates\": [{\"content\": {\"parts\": [{\"text\": \"ok\"}]}}]}\ndata: {oops\ndata: {\"candidates\": []}\n";
        let items = fragments(body);
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
    }

    #[test]
    fn gemini_payload_carries_history_and_safety() {
        let mut config = EngineConfig::default();
        config.gemini_api_key = Some("k".to_string());
        let model = GeminiModel::from_config(&config).unwrap();
        let history = vec![
            Utterance {
                role: Role::User,
                text: "hi".to_string(),
            },
            Utterance {
                role: Role::Model,
                text: "hello".to_string(),
            },
        ];
        let payload = model.build_payload(&history, "how are you");
        assert_eq!(payload["contents"][1]["role"], json!("model"));
        assert_eq!(payload["contents"][2]["parts"][0]["text"], json!("how are you"));
        assert_eq!(payload["safetySettings"].as_array().map(Vec::len), Some(4));
        assert_eq!(payload["safetySettings"][0]["threshold"], json!("BLOCK_NONE"));
        assert!(model.endpoint().ends_with("/models/gemini-pro:streamGenerateContent"));
    }

    #[test]
    fn gemini_requires_api_key() {
        assert!(GeminiModel::from_config(&EngineConfig::default()).is_err());
    }

    #[test]
    fn dryrun_reply_is_deterministic() -> anyhow::Result<()> {
        let model = DryrunModel::new();
        let text: String = model
            .open_stream(&[], "ping")?
            .collect::<anyhow::Result<Vec<String>>>()?
            .concat();
        assert_eq!(text, "Dryrun reply #1 to: ping");

        let scripted = DryrunModel::new().with_fragments(["a", "b"]);
        let parts: Vec<String> = scripted.open_stream(&[], "x")?.collect::<anyhow::Result<_>>()?;
        assert_eq!(parts, vec!["a", "b"]);
        Ok(())
    }
}

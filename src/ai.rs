use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use actix_web::{web, HttpResponse};
use async_trait::async_trait;
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::app_state::AppState;
use crate::auth::AuthenticatedUser;
use crate::config::AiConfig;
use crate::errors::ApiError;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {provider} failed: {source}")]
    Http {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} returned status {status}")]
    Status { provider: &'static str, status: u16 },
    #[error("{0} returned an empty completion")]
    Empty(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Chat,
    Code,
}

/// What the assistant sends back into the room. `file_tree` is only present
/// for code requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AiReply {
    #[serde(default)]
    pub text: String,
    #[serde(default, alias = "fileTree", skip_serializing_if = "Option::is_none")]
    pub file_tree: Option<BTreeMap<String, String>>,
    #[serde(default, alias = "buildCommand", skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    #[serde(default, alias = "startCommand", skip_serializing_if = "Option::is_none")]
    pub start_command: Option<String>,
}

// ─── HEURISTICS ────────────────────────────────────────────────────────────────

/// Checked in order; the first entry wins ties.
const LANGUAGE_KEYWORDS: &[(&str, &[&str])] = &[
    ("javascript", &["javascript", "js", "node", "nodejs", "express", "react", "npm"]),
    ("python", &["python", "py", "django", "flask", "pandas", "numpy", "pip"]),
    ("cpp", &["c++", "cpp", "g++"]),
    ("c", &["c", "gcc"]),
    ("shell", &["bash", "shell", "sh"]),
];

const CODE_KEYWORDS: &[&str] = &[
    "code", "program", "function", "script", "implement", "build", "create", "write", "app",
    "server", "api", "class", "compile", "debug", "refactor",
];

pub const DEFAULT_LANGUAGE: &str = "javascript";

/// True when the text tags the assistant.
pub fn mentions_ai(text: &str) -> bool {
    text.to_lowercase().contains("@ai")
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '+' || c == '#'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

pub fn detect_language(text: &str) -> &'static str {
    let words: Vec<String> = tokens(text).collect();
    let mut best = (DEFAULT_LANGUAGE, 0usize);
    for (language, keywords) in LANGUAGE_KEYWORDS {
        let hits = words
            .iter()
            .filter(|w| keywords.contains(&w.as_str()))
            .count();
        if hits > best.1 {
            best = (*language, hits);
        }
    }
    best.0
}

pub fn detect_intent(text: &str) -> Intent {
    if text.contains("```") {
        return Intent::Code;
    }
    let code_like = tokens(text).any(|w| {
        CODE_KEYWORDS.contains(&w.as_str())
            || LANGUAGE_KEYWORDS
                .iter()
                .any(|(_, keywords)| keywords.contains(&w.as_str()))
    });
    if code_like {
        Intent::Code
    } else {
        Intent::Chat
    }
}

fn strip_mention(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?i)@ai\b").expect("valid mention regex"));
    re.replace_all(text, "").trim().to_string()
}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*\s*(.*?)```").expect("valid fence regex"))
}

/// Turns raw model output into a reply. Code answers must be a JSON object;
/// chat answers may also be plain text.
pub fn clean_response(raw: &str, intent: Intent) -> Option<AiReply> {
    let unfenced = match fence_regex().captures(raw) {
        Some(caps) if raw.trim_start().starts_with("```") => caps[1].trim().to_string(),
        _ => raw.trim().to_string(),
    };
    if unfenced.is_empty() {
        return None;
    }

    if let (Some(start), Some(end)) = (unfenced.find('{'), unfenced.rfind('}')) {
        if start < end {
            if let Ok(reply) = serde_json::from_str::<AiReply>(&unfenced[start..=end]) {
                if !reply.text.trim().is_empty() || reply.file_tree.is_some() {
                    return Some(reply);
                }
            }
        }
    }

    match intent {
        Intent::Chat => Some(AiReply {
            text: unfenced,
            ..AiReply::default()
        }),
        Intent::Code => None,
    }
}

pub fn fallback_reply(intent: Intent, language: &str) -> AiReply {
    if intent == Intent::Chat {
        return AiReply {
            text: "I'm having trouble reaching the AI service right now. Please try again in a moment."
                .to_string(),
            ..AiReply::default()
        };
    }

    let (files, build, start) = match language {
        "python" => (
            vec![("main.py", "print(\"Hello from your new project!\")\n")],
            None,
            "python3 main.py",
        ),
        "c" => (
            vec![(
                "main.c",
                "#include <stdio.h>\n\nint main(void) {\n    printf(\"Hello from your new project!\\n\");\n    return 0;\n}\n",
            )],
            Some("gcc main.c -o main"),
            "./main",
        ),
        "cpp" => (
            vec![(
                "main.cpp",
                "#include <iostream>\n\nint main() {\n    std::cout << \"Hello from your new project!\" << std::endl;\n    return 0;\n}\n",
            )],
            Some("g++ main.cpp -o main"),
            "./main",
        ),
        "shell" => (
            vec![("main.sh", "#!/bin/sh\necho \"Hello from your new project!\"\n")],
            None,
            "sh main.sh",
        ),
        _ => (
            vec![
                ("app.js", "console.log(\"Hello from your new project!\");\n"),
                (
                    "package.json",
                    "{\n  \"name\": \"starter\",\n  \"version\": \"1.0.0\",\n  \"main\": \"app.js\"\n}\n",
                ),
            ],
            None,
            "node app.js",
        ),
    };

    AiReply {
        text: format!(
            "The AI service is unavailable, so here is a {} starter project to build on.",
            language
        ),
        file_tree: Some(
            files
                .iter()
                .map(|(path, contents)| (path.to_string(), contents.to_string()))
                .collect(),
        ),
        build_command: build.map(str::to_string),
        start_command: Some(start.to_string()),
    }
}

fn system_prompt(intent: Intent, language: &str) -> String {
    match intent {
        Intent::Chat => "You are a helpful assistant inside a collaborative coding workspace. \
             Answer concisely. Respond with a JSON object {\"text\": \"...\"}."
            .to_string(),
        Intent::Code => format!(
            "You are an expert {language} developer inside a collaborative coding workspace. \
             Respond ONLY with a JSON object of the form \
             {{\"text\": \"short explanation\", \"fileTree\": {{\"path\": \"file contents\"}}, \
             \"buildCommand\": \"optional\", \"startCommand\": \"command to run\"}}. \
             Use relative file paths and write complete, runnable files."
        ),
    }
}

// ─── PROVIDERS ─────────────────────────────────────────────────────────────────

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, AiError>;
}

async fn post_json(
    provider: &'static str,
    request: reqwest::RequestBuilder,
    body: serde_json::Value,
) -> Result<serde_json::Value, AiError> {
    let resp = request
        .json(&body)
        .send()
        .await
        .map_err(|source| AiError::Http { provider, source })?;
    if !resp.status().is_success() {
        return Err(AiError::Status {
            provider,
            status: resp.status().as_u16(),
        });
    }
    resp.json::<serde_json::Value>()
        .await
        .map_err(|source| AiError::Http { provider, source })
}

fn non_empty(provider: &'static str, text: Option<&str>) -> Result<String, AiError> {
    text.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or(AiError::Empty(provider))
}

pub struct Gemini {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

#[async_trait]
impl CompletionProvider for Gemini {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String, AiError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        );
        let body = json!({
            "systemInstruction": { "parts": [{ "text": system }] },
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": { "temperature": 0.4 }
        });
        let value = post_json(
            self.name(),
            self.client.post(url).query(&[("key", self.api_key.as_str())]),
            body,
        )
        .await?;
        non_empty(
            self.name(),
            value["candidates"][0]["content"]["parts"][0]["text"].as_str(),
        )
    }
}

pub struct OpenAi {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[async_trait]
impl CompletionProvider for OpenAi {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String, AiError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.4
        });
        let value = post_json(
            self.name(),
            self.client.post(url).bearer_auth(&self.api_key),
            body,
        )
        .await?;
        non_empty(self.name(), value["choices"][0]["message"]["content"].as_str())
    }
}

/// Ollama-compatible `/api/generate` endpoint.
pub struct LocalModel {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

#[async_trait]
impl CompletionProvider for LocalModel {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String, AiError> {
        let url = format!("{}/api/generate", self.endpoint.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "system": system,
            "prompt": prompt,
            "stream": false
        });
        let value = post_json(self.name(), self.client.post(url), body).await?;
        non_empty(self.name(), value["response"].as_str())
    }
}

// ─── SERVICE ───────────────────────────────────────────────────────────────────

pub struct AiService {
    providers: Vec<Arc<dyn CompletionProvider>>,
}

impl AiService {
    /// Providers are kept in cascade order: gemini, openai, local. Ones
    /// without credentials are left out.
    pub fn from_config(config: &AiConfig) -> Result<Self, AiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(AiError::Client)?;

        let mut providers: Vec<Arc<dyn CompletionProvider>> = Vec::new();
        if let Some(api_key) = &config.gemini_api_key {
            providers.push(Arc::new(Gemini {
                client: client.clone(),
                api_key: api_key.clone(),
                model: config.gemini_model.clone(),
            }));
        }
        if let Some(api_key) = &config.openai_api_key {
            providers.push(Arc::new(OpenAi {
                client: client.clone(),
                api_key: api_key.clone(),
                model: config.openai_model.clone(),
                base_url: config.openai_base_url.clone(),
            }));
        }
        if let Some(endpoint) = &config.local_endpoint {
            providers.push(Arc::new(LocalModel {
                client,
                endpoint: endpoint.clone(),
                model: config.local_model.clone(),
            }));
        }

        info!(
            "AI providers configured: [{}]",
            providers.iter().map(|p| p.name()).collect::<Vec<_>>().join(", ")
        );
        Ok(Self { providers })
    }

    #[cfg(test)]
    pub fn with_providers(providers: Vec<Arc<dyn CompletionProvider>>) -> Self {
        Self { providers }
    }

    /// The requested provider first, then the rest in their usual order.
    fn cascade(&self, model_type: Option<&str>) -> Vec<Arc<dyn CompletionProvider>> {
        let preferred = model_type.map(|m| m.trim().to_lowercase());
        let mut ordered: Vec<Arc<dyn CompletionProvider>> = self.providers.clone();
        if let Some(preferred) = preferred {
            if let Some(pos) = ordered.iter().position(|p| p.name() == preferred) {
                let first = ordered.remove(pos);
                ordered.insert(0, first);
            }
        }
        ordered
    }

    /// Never fails: every provider error or unusable answer moves on to the
    /// next provider, and the fallback template closes the chain.
    pub async fn reply(&self, text: &str, model_type: Option<&str>) -> AiReply {
        let prompt = strip_mention(text);
        let intent = detect_intent(&prompt);
        let language = detect_language(&prompt);
        let system = system_prompt(intent, language);
        debug!("AI request intent={:?} language={}", intent, language);

        for provider in self.cascade(model_type) {
            match provider.complete(&system, &prompt).await {
                Ok(raw) => match clean_response(&raw, intent) {
                    Some(reply) => {
                        info!("AI reply produced by {}", provider.name());
                        return reply;
                    }
                    None => warn!("{} returned an unusable answer", provider.name()),
                },
                Err(e) => warn!("AI provider {} failed: {}", provider.name(), e),
            }
        }

        fallback_reply(intent, language)
    }
}

// ─── ENDPOINT ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default, alias = "modelType")]
    pub model_type: Option<String>,
}

/// POST /ai/generate
pub async fn generate(
    _user: AuthenticatedUser,
    data: web::Data<AppState>,
    req: web::Json<GenerateRequest>,
) -> Result<HttpResponse, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::field("prompt", "Prompt is required"));
    }
    let reply = data.ai.reply(&req.prompt, req.model_type.as_deref()).await;
    Ok(HttpResponse::Ok().json(reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Scripted {
        name: &'static str,
        answer: Result<&'static str, ()>,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl CompletionProvider for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String, AiError> {
            self.calls.lock().unwrap().push(self.name);
            self.answer
                .map(str::to_string)
                .map_err(|_| AiError::Status { provider: self.name, status: 503 })
        }
    }

    fn scripted(
        calls: &Arc<Mutex<Vec<&'static str>>>,
        specs: &[(&'static str, Result<&'static str, ()>)],
    ) -> AiService {
        AiService::with_providers(
            specs
                .iter()
                .map(|&(name, answer)| {
                    Arc::new(Scripted {
                        name,
                        answer,
                        calls: calls.clone(),
                    }) as Arc<dyn CompletionProvider>
                })
                .collect(),
        )
    }

    #[test]
    fn mention_is_case_insensitive() {
        assert!(mentions_ai("hey @AI can you help"));
        assert!(!mentions_ai("email me at ai dot com"));
    }

    #[test]
    fn detects_language_by_keyword_frequency() {
        assert_eq!(detect_language("build a flask api in python"), "python");
        assert_eq!(detect_language("write a c++ program"), "cpp");
        assert_eq!(detect_language("an express server with node"), "javascript");
        assert_eq!(detect_language("anything at all"), DEFAULT_LANGUAGE);
    }

    #[test]
    fn detects_intent() {
        assert_eq!(detect_intent("@ai how are you today?"), Intent::Chat);
        assert_eq!(detect_intent("@ai create an express server"), Intent::Code);
        assert_eq!(detect_intent("what does ```x``` mean"), Intent::Code);
    }

    #[test]
    fn strips_mention_from_prompt() {
        assert_eq!(strip_mention("@ai  write a script"), "write a script");
    }

    #[test]
    fn cleans_fenced_json() {
        let raw = "```json\n{\"text\":\"done\",\"fileTree\":{\"app.js\":\"1\"}}\n```";
        let reply = clean_response(raw, Intent::Code).unwrap();
        assert_eq!(reply.text, "done");
        assert_eq!(reply.file_tree.unwrap()["app.js"], "1");
    }

    #[test]
    fn cleans_json_surrounded_by_prose() {
        let raw = "Sure! {\"text\":\"hello\"} Hope that helps.";
        assert_eq!(clean_response(raw, Intent::Code).unwrap().text, "hello");
    }

    #[test]
    fn plain_text_only_valid_for_chat() {
        assert_eq!(
            clean_response("Just text", Intent::Chat).unwrap().text,
            "Just text"
        );
        assert!(clean_response("Just text", Intent::Code).is_none());
        assert!(clean_response("   ", Intent::Chat).is_none());
    }

    #[test]
    fn code_fallback_has_starter_files() {
        let reply = fallback_reply(Intent::Code, "python");
        assert!(reply.file_tree.unwrap().contains_key("main.py"));
        assert_eq!(reply.start_command.as_deref(), Some("python3 main.py"));
        assert!(fallback_reply(Intent::Chat, "python").file_tree.is_none());
    }

    #[tokio::test]
    async fn preferred_provider_goes_first() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let service = scripted(
            &calls,
            &[("gemini", Ok("{\"text\":\"g\"}")), ("openai", Ok("{\"text\":\"o\"}"))],
        );
        let reply = service.reply("@ai hello there", Some("openai")).await;
        assert_eq!(reply.text, "o");
        assert_eq!(*calls.lock().unwrap(), vec!["openai"]);
    }

    #[tokio::test]
    async fn cascades_then_falls_back() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let service = scripted(
            &calls,
            &[("gemini", Err(())), ("openai", Ok("not json")), ("local", Err(()))],
        );
        let reply = service.reply("@ai create a python script", None).await;
        assert_eq!(*calls.lock().unwrap(), vec!["gemini", "openai", "local"]);
        assert!(reply.file_tree.unwrap().contains_key("main.py"));
    }

    #[tokio::test]
    async fn no_providers_means_fallback() {
        let service = AiService::with_providers(Vec::new());
        let reply = service.reply("@ai hi", None).await;
        assert!(reply.text.contains("trouble reaching"));
    }
}

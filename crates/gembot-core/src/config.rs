use serde::Deserialize;

use crate::error::BotError;

const API_KEY_PLACEHOLDER: &str = "YOUR_API_KEY";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_listen")]
    pub listen: String,
    #[serde(default = "default_server_queue_limit")]
    pub queue_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_server_listen(),
            queue_limit: default_server_queue_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Model used for intent classification; falls back to `model`.
    #[serde(default)]
    pub router_model: Option<String>,
    /// Model used by the segmentation tool; falls back to `model`.
    #[serde(default)]
    pub segmentation_model: Option<String>,
    #[serde(default = "default_llm_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_llm_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_llm_enable_google_search")]
    pub enable_google_search: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_llm_model(),
            router_model: None,
            segmentation_model: None,
            timeout_seconds: default_llm_timeout_seconds(),
            max_concurrency: default_llm_max_concurrency(),
            enable_google_search: default_llm_enable_google_search(),
        }
    }
}

impl LlmConfig {
    /// Base URL with the trailing slash removed and the API version segment
    /// present exactly once.
    pub fn endpoint_base(&self) -> String {
        let cleaned = self.base_url.trim().trim_end_matches('/');
        if cleaned.is_empty() {
            return default_llm_base_url();
        }
        if cleaned.ends_with("/v1beta") || cleaned.ends_with("/v1") {
            cleaned.to_string()
        } else {
            format!("{cleaned}/v1beta")
        }
    }

    pub fn router_model(&self) -> &str {
        non_empty_or(self.router_model.as_deref(), &self.model)
    }

    pub fn segmentation_model(&self) -> &str {
        non_empty_or(self.segmentation_model.as_deref(), &self.model)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_bot_group_bot_name")]
    pub group_bot_name: String,
    #[serde(default = "default_bot_clear_history_command")]
    pub clear_history_command: String,
    /// Number of user/model pairs kept per contact; 0 keeps everything.
    #[serde(default = "default_bot_max_history_turns")]
    pub max_history_turns: usize,
    #[serde(default = "default_bot_system_prompt_path")]
    pub system_prompt_path: String,
    #[serde(default = "default_bot_system_prompt_fallback_path")]
    pub system_prompt_fallback_path: String,
    #[serde(default = "default_bot_busy_reply")]
    pub busy_reply: String,
    #[serde(default = "default_bot_image_received_reply")]
    pub image_received_reply: String,
    #[serde(default = "default_bot_history_cleared_reply")]
    pub history_cleared_reply: String,
    #[serde(default = "default_bot_history_unknown_reply")]
    pub history_unknown_reply: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            group_bot_name: default_bot_group_bot_name(),
            clear_history_command: default_bot_clear_history_command(),
            max_history_turns: default_bot_max_history_turns(),
            system_prompt_path: default_bot_system_prompt_path(),
            system_prompt_fallback_path: default_bot_system_prompt_fallback_path(),
            busy_reply: default_bot_busy_reply(),
            image_received_reply: default_bot_image_received_reply(),
            history_cleared_reply: default_bot_history_cleared_reply(),
            history_unknown_reply: default_bot_history_unknown_reply(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_dir")]
    pub dir: String,
    #[serde(default = "default_history_file_name")]
    pub file_name: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            dir: default_history_dir(),
            file_name: default_history_file_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_image_context_ttl_seconds")]
    pub context_ttl_seconds: u64,
    #[serde(default = "default_image_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_image_max_upload_dimension")]
    pub max_upload_dimension: u32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            context_ttl_seconds: default_image_context_ttl_seconds(),
            output_dir: default_image_output_dir(),
            max_upload_dimension: default_image_max_upload_dimension(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_dir")]
    pub dir: String,
    #[serde(default = "default_logging_model_io_log")]
    pub model_io_log: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_logging_dir(),
            model_io_log: default_logging_model_io_log(),
        }
    }
}

fn non_empty_or<'a>(value: Option<&'a str>, fallback: &'a str) -> &'a str {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => fallback,
    }
}

fn default_server_listen() -> String {
    "127.0.0.1:8790".to_string()
}

fn default_server_queue_limit() -> usize {
    64
}

fn default_llm_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_llm_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_llm_timeout_seconds() -> u64 {
    120
}

fn default_llm_max_concurrency() -> usize {
    2
}

fn default_llm_enable_google_search() -> bool {
    true
}

fn default_bot_group_bot_name() -> String {
    "AI助手".to_string()
}

fn default_bot_clear_history_command() -> String {
    "清除历史记录".to_string()
}

fn default_bot_max_history_turns() -> usize {
    10
}

fn default_bot_system_prompt_path() -> String {
    "prompt.txt".to_string()
}

fn default_bot_system_prompt_fallback_path() -> String {
    "prompt.txt.template".to_string()
}

fn default_bot_busy_reply() -> String {
    "抱歉，我现在有点忙，稍后再试吧。".to_string()
}

fn default_bot_image_received_reply() -> String {
    "图片收到！请告诉我需要对它做什么。".to_string()
}

fn default_bot_history_cleared_reply() -> String {
    "好的，我已经忘记我们之前聊过什么了。有什么新话题吗？".to_string()
}

fn default_bot_history_unknown_reply() -> String {
    "嗯...我好像还不认识你，没有找到我们的聊天记录。".to_string()
}

fn default_history_dir() -> String {
    "history".to_string()
}

fn default_history_file_name() -> String {
    "sessions.json".to_string()
}

fn default_image_context_ttl_seconds() -> u64 {
    3000
}

fn default_image_output_dir() -> String {
    "segment_output".to_string()
}

fn default_image_max_upload_dimension() -> u32 {
    1024
}

fn default_logging_dir() -> String {
    "logs".to_string()
}

fn default_logging_model_io_log() -> bool {
    true
}

impl AppConfig {
    pub fn load(path: &str) -> Result<Self, BotError> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("GEMBOT")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;
        let mut out: AppConfig = cfg.try_deserialize()?;
        // Older deployments only export GEMINI_API_KEY.
        let key = out.llm.api_key.trim();
        if key.is_empty() || key == API_KEY_PLACEHOLDER {
            if let Ok(key) = std::env::var("GEMINI_API_KEY") {
                out.llm.api_key = key;
            }
        }
        out.validate()?;
        Ok(out)
    }

    pub fn validate(&self) -> Result<(), BotError> {
        let key = self.llm.api_key.trim();
        if key.is_empty() || key == API_KEY_PLACEHOLDER {
            return Err(BotError::InvalidConfig(
                "llm.api_key is not configured (set GEMBOT_LLM__API_KEY or GEMINI_API_KEY)".to_string(),
            ));
        }
        if self.llm.model.trim().is_empty() {
            return Err(BotError::InvalidConfig("llm.model must not be empty".to_string()));
        }
        if self.server.queue_limit == 0 {
            return Err(BotError::InvalidConfig("server.queue_limit must be positive".to_string()));
        }
        Ok(())
    }
}

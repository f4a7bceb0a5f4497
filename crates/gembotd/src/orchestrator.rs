use std::collections::HashMap;
use std::iter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use gembot_core::config::AppConfig;
use gembot_core::types::Turn;
use tracing::{error, info, warn};

use crate::image_context::ImageContextCache;
use crate::intent_router::IntentRouter;
use crate::llm_gateway::{Content, LlmBackend, Part};
use crate::segment_tool::{SegmentationTool, encode_png_for_upload};
use crate::session_store::SessionStore;
use crate::strategy::{Exchange, StrategyExecutor};
use crate::truncate_for_log;

/// Stored in history for turns that carried only an image.
const IMAGE_ONLY_TURN: &str = "[image]";
const GROUP_CHAT_INSTRUCTION: &str =
    "当前是群聊，每条用户消息都以“发送者名称: ”开头，请结合发送者回答。";

/// Entry point for one inbound exchange: routes, executes, and commits history.
pub(crate) struct Orchestrator {
    sessions: Arc<SessionStore>,
    images: Arc<ImageContextCache>,
    router: IntentRouter,
    executor: StrategyExecutor,
    system_prompt: String,
    max_history_turns: usize,
    max_upload_dimension: u32,
    busy_reply: String,
    contact_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub(crate) fn new(
        config: &AppConfig,
        backend: Arc<dyn LlmBackend>,
        tool: Arc<dyn SegmentationTool>,
        sessions: Arc<SessionStore>,
        images: Arc<ImageContextCache>,
        system_prompt: String,
    ) -> Self {
        Self {
            sessions,
            images,
            router: IntentRouter::new(backend.clone(), config.llm.router_model()),
            executor: StrategyExecutor::new(
                backend,
                tool,
                config.llm.model.clone(),
                config.llm.enable_google_search,
            ),
            system_prompt,
            max_history_turns: config.bot.max_history_turns,
            max_upload_dimension: config.image.max_upload_dimension,
            busy_reply: config.bot.busy_reply.clone(),
            contact_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Never fails: any error becomes the busy reply and leaves history untouched.
    pub(crate) async fn respond(
        &self,
        contact_id: &str,
        message_text: &str,
        image_path: Option<PathBuf>,
        is_group: bool,
        sender: Option<&str>,
    ) -> (String, Vec<PathBuf>) {
        let lock = self.contact_lock(contact_id);
        let _guard = lock.lock().await;
        match self
            .run_exchange(contact_id, message_text, image_path, is_group, sender)
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                error!(
                    "exchange failed contact={} text={} err={:#}",
                    contact_id,
                    truncate_for_log(message_text),
                    err
                );
                (self.busy_reply.clone(), Vec::new())
            }
        }
    }

    /// Empties the contact's history. Returns whether any history existed.
    pub(crate) async fn clear_history(&self, contact_id: &str) -> bool {
        let lock = self.contact_lock(contact_id);
        let _guard = lock.lock().await;
        let known = self.sessions.clear(contact_id);
        if known {
            if let Err(err) = self.sessions.persist_all().await {
                warn!("persist after clear failed contact={} err={}", contact_id, err);
            }
        }
        known
    }

    async fn run_exchange(
        &self,
        contact_id: &str,
        message_text: &str,
        image_path: Option<PathBuf>,
        is_group: bool,
        sender: Option<&str>,
    ) -> anyhow::Result<(String, Vec<PathBuf>)> {
        let text = message_text.trim();
        let image = image_path.or_else(|| self.images.get(contact_id));
        if text.is_empty() && image.is_none() {
            return Err(anyhow!("nothing to answer"));
        }

        self.sessions.get_or_load(contact_id);
        self.sessions.trim(contact_id, self.max_history_turns);
        let history = self.sessions.get_or_load(contact_id);

        let query = if text.is_empty() { IMAGE_ONLY_TURN } else { text };
        let intent = self.router.classify(query, &history).await;
        info!(
            "exchange start contact={} sender={} intent={} history_turns={} image={}",
            contact_id,
            sender.unwrap_or("-"),
            intent,
            history.len(),
            image.is_some()
        );

        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(Part::text(text));
        }
        if let Some(path) = &image {
            match self.inline_image(path).await {
                Ok(part) => parts.push(part),
                Err(err) => warn!(
                    "attach image failed, continuing text-only path={} err={:#}",
                    path.display(),
                    err
                ),
            }
        }
        if parts.is_empty() {
            parts.push(Part::text(IMAGE_ONLY_TURN));
        }
        let contents = history
            .iter()
            .map(Content::from_turn)
            .chain(iter::once(Content::user(parts)))
            .collect();

        let mut system_instruction = self.system_prompt.clone();
        if is_group {
            system_instruction.push_str("\n\n");
            system_instruction.push_str(GROUP_CHAT_INSTRUCTION);
        }

        let exchange = Exchange {
            contact_id,
            contents,
            system_instruction,
        };
        let output = self
            .executor
            .execute(intent, &exchange)
            .await
            .with_context(|| format!("{intent} executor failed"))?;
        if output.text.trim().is_empty() && output.files.is_empty() {
            return Err(anyhow!("{intent} executor returned an empty answer"));
        }

        self.sessions.append(
            contact_id,
            vec![Turn::user(query), Turn::model(output.text.clone())],
        );
        self.sessions.trim(contact_id, self.max_history_turns);
        if let Err(err) = self.sessions.persist_all().await {
            warn!("persist history failed contact={} err={}", contact_id, err);
        }
        info!(
            "exchange done contact={} intent={} files={} reply={}",
            contact_id,
            intent,
            output.files.len(),
            truncate_for_log(&output.text)
        );
        Ok((output.text, output.files))
    }

    async fn inline_image(&self, path: &Path) -> anyhow::Result<Part> {
        let path = path.to_path_buf();
        let max_dim = self.max_upload_dimension;
        let b64 = tokio::task::spawn_blocking(move || encode_png_for_upload(&path, max_dim))
            .await
            .context("image encode task")??;
        Ok(Part::inline("image/png", b64))
    }

    fn contact_lock(&self, contact_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .contact_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(contact_id.to_string()).or_default().clone()
    }
}

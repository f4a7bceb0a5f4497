use std::path;
use std::sync::Arc;

use chrono::Utc;
use gembot_core::config::BotConfig;
use gembot_core::types::{InboundMessage, MessageKind, OutboundReply};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::image_context::ImageContextCache;
use crate::orchestrator::Orchestrator;
use crate::truncate_for_log;

#[derive(Debug, Error)]
pub(crate) enum DispatchError {
    #[error("message queue is full")]
    QueueFull,
    #[error("message queue is closed")]
    Closed,
    #[error("reply was dropped before completion")]
    ReplyDropped,
}

pub(crate) struct QueuedMessage {
    message: InboundMessage,
    reply: oneshot::Sender<OutboundReply>,
}

/// Producer side of the message queue.
#[derive(Clone)]
pub(crate) struct DispatchHandle {
    tx: mpsc::Sender<QueuedMessage>,
    capacity: usize,
}

impl DispatchHandle {
    /// Enqueues without waiting for room, then waits for the reply.
    pub(crate) async fn submit(
        &self,
        message: InboundMessage,
    ) -> Result<OutboundReply, DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .try_send(QueuedMessage {
                message,
                reply: reply_tx,
            })
            .map_err(|err| match err {
                TrySendError::Full(_) => DispatchError::QueueFull,
                TrySendError::Closed(_) => DispatchError::Closed,
            })?;
        reply_rx.await.map_err(|_| DispatchError::ReplyDropped)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn available(&self) -> usize {
        self.tx.capacity()
    }
}

pub(crate) fn channel(queue_limit: usize) -> (DispatchHandle, mpsc::Receiver<QueuedMessage>) {
    let capacity = queue_limit.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (DispatchHandle { tx, capacity }, rx)
}

/// Applies chat rules to inbound messages before they reach the orchestrator.
pub(crate) struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    images: Arc<ImageContextCache>,
    bot: BotConfig,
}

impl Dispatcher {
    pub(crate) fn new(
        orchestrator: Arc<Orchestrator>,
        images: Arc<ImageContextCache>,
        bot: BotConfig,
    ) -> Self {
        Self {
            orchestrator,
            images,
            bot,
        }
    }

    /// An empty reply means the message was ignored.
    pub(crate) async fn handle(&self, message: InboundMessage) -> OutboundReply {
        let InboundMessage {
            chat_id,
            sender,
            is_group,
            kind,
        } = message;
        match kind {
            MessageKind::Image { path } => {
                let path = path::absolute(&path).unwrap_or(path);
                self.images.update(&chat_id, path, Utc::now());
                if is_group {
                    // Groups only hear from the bot when it is mentioned.
                    return OutboundReply::default();
                }
                OutboundReply::text(self.bot.image_received_reply.clone())
            }
            MessageKind::Tickle { content } => {
                let bot_name = self.bot.group_bot_name.trim_start_matches('@');
                if is_group || bot_name.is_empty() || !content.contains(bot_name) {
                    debug!("tickle ignored chat_id={} content={}", chat_id, content);
                    return OutboundReply::default();
                }
                let text = format!("[{} 拍了拍我]", sender);
                self.process(&chat_id, &text, is_group, &sender).await
            }
            MessageKind::Text { content } => {
                let mut text = content.trim().to_string();
                let clear_command = self.bot.clear_history_command.trim();
                if is_group && text != clear_command {
                    let mention = format!("@{}", self.bot.group_bot_name.trim_start_matches('@'));
                    if !text.contains(&mention) {
                        debug!("group message without mention ignored chat_id={}", chat_id);
                        return OutboundReply::default();
                    }
                    text = text.replace(&mention, "").trim().to_string();
                }
                if text == clear_command {
                    return self.clear(&chat_id).await;
                }
                if is_group && !text.is_empty() {
                    text = format!("{}: {}", sender, text);
                }
                self.process(&chat_id, &text, is_group, &sender).await
            }
        }
    }

    async fn clear(&self, chat_id: &str) -> OutboundReply {
        if self.orchestrator.clear_history(chat_id).await {
            OutboundReply::text(self.bot.history_cleared_reply.clone())
        } else {
            OutboundReply::text(self.bot.history_unknown_reply.clone())
        }
    }

    async fn process(
        &self,
        chat_id: &str,
        text: &str,
        is_group: bool,
        sender: &str,
    ) -> OutboundReply {
        if text.trim().is_empty() && self.images.get(chat_id).is_none() {
            info!("empty message without image ignored chat_id={}", chat_id);
            return OutboundReply::default();
        }
        let (reply, files) = self
            .orchestrator
            .respond(chat_id, text, None, is_group, Some(sender))
            .await;
        OutboundReply {
            text: Some(reply).filter(|t| !t.trim().is_empty()),
            files,
        }
    }
}

/// Single consumer: messages are handled one at a time in arrival order.
pub(crate) fn spawn_consumer(
    dispatcher: Arc<Dispatcher>,
    mut rx: mpsc::Receiver<QueuedMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(QueuedMessage { message, reply }) = rx.recv().await {
            let chat_id = message.chat_id.clone();
            info!(
                "message dequeued chat_id={} sender={} group={} kind={}",
                chat_id,
                message.sender,
                message.is_group,
                kind_name(&message.kind)
            );
            let worker = dispatcher.clone();
            // A panic inside one exchange must not take the consumer down.
            let out = match tokio::spawn(async move { worker.handle(message).await }).await {
                Ok(out) => out,
                Err(err) => {
                    error!("message handler crashed chat_id={} err={}", chat_id, err);
                    OutboundReply::text(dispatcher.bot.busy_reply.clone())
                }
            };
            if let Some(text) = &out.text {
                info!(
                    "reply ready chat_id={} files={} text={}",
                    chat_id,
                    out.files.len(),
                    truncate_for_log(text)
                );
            }
            if reply.send(out).is_err() {
                warn!("reply receiver gone chat_id={}", chat_id);
            }
        }
        info!("message queue closed, consumer exiting");
    })
}

fn kind_name(kind: &MessageKind) -> &'static str {
    match kind {
        MessageKind::Text { .. } => "text",
        MessageKind::Image { .. } => "image",
        MessageKind::Tickle { .. } => "tickle",
    }
}

//! One bot, one chat: outbound notifications with rate-limit backoff, and a
//! long-polling loop that feeds chat messages back to the hub as commands.

use std::time::Duration;

use {
    anyhow::Result,
    async_trait::async_trait,
    secrecy::ExposeSecret,
    teloxide::{
        Bot, RequestError,
        prelude::*,
        types::{AllowedUpdate, ChatId, UpdateKind},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    trellis_bridge::{InboundHandler, NotifyBridge},
    trellis_config::TelegramConfig,
};

const RETRY_AFTER_MAX_RETRIES: usize = 4;
const POLL_TIMEOUT_SECS: u32 = 30;
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct TelegramBridge {
    bot: Bot,
    chat_id: ChatId,
    cancel: CancellationToken,
}

impl TelegramBridge {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            bot: Bot::new(config.bot_token.expose_secret()),
            chat_id: ChatId(config.chat_id),
            cancel: CancellationToken::new(),
        }
    }
}

impl Drop for TelegramBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl NotifyBridge for TelegramBridge {
    async fn send(&self, text: &str) -> Result<()> {
        let mut retries = 0usize;
        loop {
            match self.bot.send_message(self.chat_id, text).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    let Some(wait) = retry_after_duration(&err) else {
                        return Err(err.into());
                    };
                    if retries >= RETRY_AFTER_MAX_RETRIES {
                        warn!(
                            retries,
                            retry_after_secs = wait.as_secs(),
                            "telegram rate limit persisted after retries"
                        );
                        return Err(err.into());
                    }
                    retries += 1;
                    warn!(
                        retries,
                        retry_after_secs = wait.as_secs(),
                        "telegram rate limited, waiting before retry"
                    );
                    tokio::time::sleep(wait).await;
                },
            }
        }
    }

    async fn start_inbound(&self, handler: InboundHandler) -> Result<()> {
        // Verify credentials and clear any webhook so long polling works.
        let me = self.bot.get_me().await?;
        self.bot.delete_webhook().send().await?;
        info!(username = ?me.username, "telegram bridge connected (webhook cleared)");

        let bot = self.bot.clone();
        let chat_id = self.chat_id;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut offset: i32 = 0;
            loop {
                let request = bot
                    .get_updates()
                    .offset(offset)
                    .timeout(POLL_TIMEOUT_SECS)
                    .allowed_updates(vec![AllowedUpdate::Message]);
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = request => result,
                };

                match result {
                    Ok(updates) => {
                        for update in updates {
                            offset = offset.max(update.id.0 as i32 + 1);
                            let UpdateKind::Message(message) = update.kind else {
                                continue;
                            };
                            if message.chat.id != chat_id {
                                debug!(chat = %message.chat.id, "ignoring message from foreign chat");
                                continue;
                            }
                            let Some(text) = message.text() else { continue };
                            handler(text.to_string()).await;
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "telegram polling failed");
                        tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                    },
                }
            }
            info!("telegram polling stopped");
        });

        Ok(())
    }
}

fn retry_after_duration(error: &RequestError) -> Option<Duration> {
    match error {
        RequestError::RetryAfter(wait) => Some(wait.duration()),
        _ => None,
    }
}

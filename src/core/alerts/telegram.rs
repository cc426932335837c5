use async_trait::async_trait;
use teloxide::RequestError;
use teloxide::prelude::*;

use super::AlertSink;
use crate::core::error::{SupervisorError, SupervisorResult};

/// Delivers alerts as plain-text messages to one Telegram chat.
pub struct TelegramSink {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramSink {
    pub fn new(token: &str, chat_id: i64) -> Self {
        Self {
            bot: Bot::new(token),
            chat_id: ChatId(chat_id),
        }
    }
}

fn classify(err: RequestError) -> SupervisorError {
    let transient = matches!(
        err,
        RequestError::Network(_) | RequestError::Io(_) | RequestError::RetryAfter(_)
    );
    SupervisorError::AlertDelivery {
        transient,
        reason: err.to_string(),
    }
}

#[async_trait]
impl AlertSink for TelegramSink {
    async fn deliver(&self, text: &str) -> SupervisorResult<()> {
        self.bot
            .send_message(self.chat_id, text.to_string())
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

use poise::serenity_prelude::{ChannelId, EditMessage, Http, MessageId};
use std::sync::Arc;

/// Handle to a previously published transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef(pub u64);

/// Outgoing message surface for published transcript lines. One sink per
/// session, bound to the destination text channel.
#[async_trait::async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn send(&self, content: &str) -> anyhow::Result<MessageRef>;
    async fn edit(&self, message: MessageRef, content: &str) -> anyhow::Result<()>;
}

/// Discord text-channel sink.
pub struct ChannelSink {
    http: Arc<Http>,
    channel_id: ChannelId,
}

impl ChannelSink {
    pub fn new(http: Arc<Http>, channel_id: ChannelId) -> Self {
        Self { http, channel_id }
    }
}

#[async_trait::async_trait]
impl TranscriptSink for ChannelSink {
    async fn send(&self, content: &str) -> anyhow::Result<MessageRef> {
        let msg = self.channel_id.say(&self.http, content).await?;
        Ok(MessageRef(msg.id.get()))
    }

    async fn edit(&self, message: MessageRef, content: &str) -> anyhow::Result<()> {
        self.channel_id
            .edit_message(
                &self.http,
                MessageId::new(message.0),
                EditMessage::new().content(content),
            )
            .await?;
        Ok(())
    }
}

//! Multi-channel message adapters
//!
//! Each adapter turns one platform's wire protocol into bus envelopes and
//! back; the [`ChannelManager`] owns them all and routes outbound traffic.

mod adapter;
mod dingtalk;
mod discord;
mod feishu;
mod inbound;
mod manager;
mod slack;
mod telegram;
mod ws;

pub use adapter::{AdapterContext, ChannelAdapter};
pub use dingtalk::DingTalkAdapter;
pub use discord::DiscordAdapter;
pub use feishu::FeishuAdapter;
pub use inbound::{AllowList, Inbound};
pub use manager::{ChannelManager, DEFAULT_SHUTDOWN_GRACE};
pub use slack::SlackAdapter;
pub use telegram::TelegramAdapter;

//! Outbound text shaping: splitting to platform limits and markup dialects

mod chunk;
mod markup;

pub use chunk::chunk_message;
pub use markup::{transform, Markup, SlackMrkdwn, TelegramHtml};

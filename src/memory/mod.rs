//! 短期记忆：单次运行内的对话记录

pub mod conversation;

pub use conversation::{Message, Role};

//! LLM 层：Provider 抽象与实现（OpenAI 兼容 / 脚本化 Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::ScriptedProvider;
pub use openai::{OpenAiCompatProvider, TokenUsage};
pub use traits::{
    collect_turn, ChatRequest, ChunkStream, ModelTurn, ProviderClient, ProviderError, ProviderSlot, StreamChunk,
};

//! 执行引擎：AgentLoop、运行配置、结果与过程观察

pub mod events;
pub mod loop_;
pub mod options;
pub mod result;

pub use events::{AgentEvent, AgentObserver, ChannelObserver, NoopObserver, TracingObserver};
pub use loop_::AgentLoop;
pub use options::{AgentOptions, ChatMode};
pub use result::{AgentResult, StopReason, ToolCallRecord};

//! Language model abstraction and the rig-core backend

mod provider;
mod rig_adapter;

pub use provider::{
    chunk_text, complete_json, extract_json, parse_json, LanguageModel, LlmRequest, LlmTask,
    TextStream, STREAM_CHUNK_CHARS,
};
pub use rig_adapter::{LlmBackend, RigLanguageModel};

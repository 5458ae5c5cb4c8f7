//! Provider-agnostic LLM access: an ordered fallback chain over
//! OpenAI-compatible chat endpoints, with native tool calls where the
//! provider supports them and a plain-text parser fallback where it does not.

pub mod gateway;
pub mod provider;
pub mod tool_call;

pub use gateway::{Generation, GenerationRequest, LlmGateway, LlmStream, ToolSpec};
pub use provider::{HttpChatProvider, LlmEvent, ProviderOutcome, ToolInvocation};
pub use tool_call::{build_tool_instructions, extract_first_json_object, parse_text_tool_call};

//! API translation between Anthropic and backend formats.
//!
//! The core of the proxy: converts requests, responses, and streaming events
//! between the Anthropic Messages API and the `OpenAI` / Gemini APIs. All
//! translation functions are pure (no I/O).

pub mod adapter;
pub mod anthropic_types;
pub mod cfp;
pub mod gemini;
pub mod gemini_types;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;

//! Composer variants: an LLM-backed composer and a
//! rule-based grid composer, both built on the shared `guardrails` core.

pub mod grid;
pub mod guardrails;
pub mod llm;

pub use grid::GridComposer;
pub use llm::LlmComposer;

pub mod chapter;
pub mod export;
pub mod library;
pub mod llm;
pub mod orchestrator;
pub mod outline;
pub mod prompts;
pub mod revision;
pub mod sse;
#[cfg(test)]
pub mod testing;

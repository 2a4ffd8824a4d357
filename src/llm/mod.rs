//! Model access.
//!
//! Stages call models only through [`ProviderAdapter`]. The crate ships an
//! OpenAI-compatible HTTP adapter and a subprocess adapter; a
//! [`ProviderRegistry`] routes `provider:model` ids to them.
//!
//! ```ignore
//! use evalforge::llm::{InvokeRequest, ProviderRegistry};
//!
//! let registry = ProviderRegistry::from_settings(&settings)?.with_subprocess_generators(&config);
//! let adapter = registry.resolve("openai:gpt-4o-mini")?;
//! let request = InvokeRequest::new("openai:gpt-4o-mini", "Summarise this", timeout)
//!     .with_temperature(0.2);
//! let output = adapter.invoke(&request, &cancel).await?;
//! ```

pub mod adapter;
pub mod openai;
pub mod registry;
pub mod subprocess;

pub use adapter::{
    estimate_tokens, split_model, InvokeOutput, InvokeParams, InvokeRequest, Message,
    ProviderAdapter, Usage,
};
pub use openai::OpenAiCompatibleAdapter;
pub use registry::ProviderRegistry;
pub use subprocess::SubprocessAdapter;

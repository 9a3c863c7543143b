//! Region-masked plant replacement: mask, generate, verify, retry, chain.

pub mod chain;
pub mod controller;
pub mod imaging;
pub mod job;
pub mod mask;
pub mod providers;
pub mod similarity;

#[cfg(test)]
mod test_support;

pub use chain::{ChainInput, ChainOutcome, ChainStep, EditChain};
pub use controller::{candidate_label, RetryController, StepInput, StepOutcome};
pub use job::{ControlError, JobHandle, JobOptions, JobStore};
pub use providers::{
    default_registry, GenerationClient, GenerationClientRegistry, GenerationError,
    GenerationRequest, GenerationResponse, ImagePayload,
};
pub use similarity::Comparator;

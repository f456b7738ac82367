//! Instruction package compilation and provider adapters.
//!
//! The compiler turns (role, agent, priorities, overrides, provider) into a
//! deterministic on-disk package; adapters translate that package into the
//! provider-native file at the sandbox root, or into a structured prompt
//! envelope when no native shape exists.

mod adapters;
mod compiler;

pub use adapters::{
    AdapterRegistry, AdapterResult, PromptEnvelope, ProviderAdapter, ProviderFamily,
};
pub use compiler::{
    CompileError, InstructionCompiler, InstructionPackage, InstructionSource, Priority,
    ProviderDescriptor, RunMode,
};

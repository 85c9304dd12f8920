//! Goal-execution engine driven by a language model.
//!
//! A user submits a natural-language goal; the engine repeatedly asks the
//! model for the next action, extracts a [`core::directive::Directive`] from
//! the reply, validates it, executes it on the host and feeds the result back
//! until the model declares the goal done. The architecture keeps a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (types, directive extraction,
//!   safety validation, truncation, history windowing). No I/O.
//! - **[`io`]**: Side-effecting adapters (configuration, subprocesses, model
//!   client, environment probe, prompts, durable store, step logs,
//!   self-update). Behind traits where tests need doubles.
//!
//! Orchestration modules ([`registry`], [`bus`], [`functions`],
//! [`task_loop`], [`engine`]) coordinate the two. [`engine::Engine`] is the
//! entry point used by the CLI and the HTTP server.

pub mod bus;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod functions;
pub mod io;
pub mod logging;
pub mod registry;
pub mod task_loop;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use engine::{Engine, EngineParts, ModelStatus};
pub use error::{EngineError, EngineResult};

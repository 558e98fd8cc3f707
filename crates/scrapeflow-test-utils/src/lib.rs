//! Scripted collaborators and fixtures shared by scrapeflow tests.
//!
//! Every double is deterministic: the same script produces the same calls
//! and answers, which the determinism tests rely on.

pub mod collaborators;
pub mod fixtures;

pub use collaborators::{
    FetchStep, LlmStep, PlainParser, ProductLlm, ScriptedDescriber, ScriptedFetcher,
    ScriptedLimiter, ScriptedLlm,
};
pub use fixtures::{expected_products, fixture_dir, product_schema, PRODUCT_PAGE};

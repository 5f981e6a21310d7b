//! mashtun: a declarative package recipe evaluator.
//!
//! Recipes are TOML files describing where to fetch a source archive, how to
//! verify it, and which commands turn it into an installed package under a
//! versioned store. The library resolves dependency graphs, runs build
//! phases with bounded parallelism, and links finished kegs into a shared
//! prefix with relative symlinks.

pub mod commands;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod installer;
pub mod manifest;
pub mod recipe;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod unpack;

pub use error::{MashError, Result};
pub use recipe::Recipe;
pub use store::Store;

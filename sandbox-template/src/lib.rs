//! Builds sandbox images from a declarative template and verifies them by
//! running checks inside a fresh instance.
//!
//! The sandbox service sits behind [`SandboxService`], the template source
//! behind [`TemplateFrontend`]. [`Builder`] and [`Verifier`] only talk to
//! those traits.

pub mod backends;
pub mod builder;
pub mod config;
pub mod console;
pub mod error;
pub mod frontends;
pub mod hasher;
pub mod models;
pub mod services;
pub mod validate;
pub mod verifier;

pub use builder::Builder;
pub use error::{Error, Result};
pub use services::{SandboxInstance, SandboxService, TemplateFrontend};
pub use verifier::Verifier;

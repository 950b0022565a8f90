//! Resolution engine and template rendering.

pub mod flowable;
pub mod render;

pub use flowable::{Evaluation, ResolutionError, Resolver};
pub use render::{TemplateRenderer, render_context, render_value};

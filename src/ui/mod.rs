//! Terminal output helpers
//!
//! Colored symbols on an interactive terminal, bracketed tags otherwise so
//! that batch logs stay greppable.

mod context;
mod output;

pub use context::UiContext;
pub use output::{step_info, step_ok, step_ok_detail, step_warn, step_warn_hint};

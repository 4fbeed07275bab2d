//! Terminal output helpers for the maintenance CLI
//!
//! Decorated output in an interactive terminal, bracket-tagged plain lines
//! in pipes and CI.

mod context;
mod output;

pub use context::UiContext;
pub use output::{
    confirm, key_value, key_value_status, remark, section, step_ok, step_ok_detail, step_warn,
    step_warn_hint,
};

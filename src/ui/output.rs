//! Output functions for consistent CLI formatting

use super::context::UiContext;
use console::style;

/// Display a success step
pub fn step_ok(ctx: &UiContext, message: &str) {
    if ctx.is_interactive() {
        println!("  {} {}", style("✔").green(), message);
    } else {
        println!("  {} {}", style("[OK]").green(), message);
    }
}

/// Display a success step with detail
pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    if ctx.is_interactive() {
        println!("  {} {} ({})", style("✔").green(), message, style(detail).dim());
    } else {
        println!("  {} {} ({})", style("[OK]").green(), message, detail);
    }
}

/// Display a warning step
pub fn step_warn(ctx: &UiContext, message: &str) {
    if ctx.is_interactive() {
        println!("  {} {}", style("▲").yellow(), message);
    } else {
        println!("  {} {}", style("[WARN]").yellow(), message);
    }
}

/// Display a warning step followed by a hint
pub fn step_warn_hint(ctx: &UiContext, message: &str, hint: &str) {
    step_warn(ctx, message);
    println!("       {}", style(hint).dim());
}

/// Display an informational step
pub fn step_info(ctx: &UiContext, message: &str) {
    if ctx.is_interactive() {
        println!("  {} {}", style("●").blue(), message);
    } else {
        println!("  {} {}", style("[INFO]").blue(), message);
    }
}


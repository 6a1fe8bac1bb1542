//! Console output for the harness CLI.

use colored::Colorize;

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a step indicator with message.
pub fn print_step(message: &str) {
    println!("{} {}", "▶".cyan(), message.bold());
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print one line of the final scenario summary.
pub fn print_outcome(scenario: &str, passed: bool, detail: &str) {
    if passed {
        println!("  {} {}", "PASS".green().bold(), scenario);
    } else {
        println!("  {} {} {}", "FAIL".red().bold(), scenario, detail.bright_black());
    }
}

use std::env;

/// ANSI color codes for CLI output
pub struct Colors;

impl Colors {
    /// Primary actions/success
    pub const MAIN: &'static str = "\x1b[38;2;95;173;235m";
    /// Info/progress
    pub const SECONDARY: &'static str = "\x1b[38;2;74;155;217m";
    /// Technical details
    pub const DIM_GRAY: &'static str = "\x1b[38;2;128;128;128m";
    /// Errors
    pub const ERROR: &'static str = "\x1b[38;2;255;59;48m";
    /// Warnings
    pub const WARNING: &'static str = "\x1b[38;2;255;149;0m";
    /// Reset all formatting
    pub const RESET: &'static str = "\x1b[0m";
}

/// Unicode symbols for different message types
pub struct Symbols;

impl Symbols {
    pub const SUCCESS: &'static str = "✓";
    pub const ERROR: &'static str = "✗";
    pub const WARNING: &'static str = "!";
    pub const INFO: &'static str = "ℹ";
    pub const ARROW: &'static str = "→";
    pub const BULLET: &'static str = "•";
}

/// Clean CLI logger for daemon startup and client commands. Operational
/// logging inside request handling goes through `tracing` instead.
pub struct Logger;

impl Logger {
    fn paint(color: &str, symbol: &str, message: &str) -> String {
        if should_use_colors() {
            format!("{}{} {}{}", color, symbol, message, Colors::RESET)
        } else {
            format!("{} {}", symbol, message)
        }
    }

    pub fn success(message: &str) {
        println!("{}", Self::paint(Colors::MAIN, Symbols::SUCCESS, message));
    }

    pub fn error(message: &str) {
        eprintln!("{}", Self::paint(Colors::ERROR, Symbols::ERROR, message));
    }

    pub fn warning(message: &str) {
        println!("{}", Self::paint(Colors::WARNING, Symbols::WARNING, message));
    }

    pub fn info(message: &str) {
        println!("{}", Self::paint(Colors::SECONDARY, Symbols::INFO, message));
    }

    /// Only shown if WEFT_DEBUG=1
    pub fn debug(message: &str) {
        if env::var("WEFT_DEBUG").is_ok() {
            println!("{}", Self::paint(Colors::DIM_GRAY, Symbols::BULLET, message));
        }
    }

    /// Display a key-value detail line, e.g. "  socket → /var/run/weft/cni.sock"
    pub fn detail(label: &str, value: &str) {
        if should_use_colors() {
            println!(
                "  {}{}{} {} {}{}",
                Colors::DIM_GRAY,
                label,
                Colors::RESET,
                Symbols::ARROW,
                Colors::SECONDARY,
                value
            );
        } else {
            println!("  {} {} {}", label, Symbols::ARROW, value);
        }
    }
}

/// Check if colors should be used: honor NO_COLOR and skip them for pipes
fn should_use_colors() -> bool {
    env::var("NO_COLOR").is_err() && console::Term::stdout().is_term()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_methods_dont_panic() {
        Logger::success("test");
        Logger::error("test");
        Logger::warning("test");
        Logger::info("test");
        Logger::detail("key", "value");
    }
}

use clap::builder::styling::{AnsiColor, Effects, Style, Styles};
use std::{fmt::Write, io::IsTerminal, sync::LazyLock};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Whether stdout is an ANSI-capable interactive terminal. Evaluated once.
static IS_ANSI_TERMINAL: LazyLock<bool> = LazyLock::new(is_ansi_interactive_terminal);

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns a `Styles` object with the default styles for the CLI.
pub fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default())
        .error(AnsiColor::Red.on_default() | Effects::BOLD)
        .valid(AnsiColor::Green.on_default() | Effects::BOLD)
        .invalid(AnsiColor::Red.on_default() | Effects::BOLD)
}

/// Whether stdout is a terminal that understands ANSI escapes.
pub fn is_ansi_interactive_terminal() -> bool {
    std::io::stdout().is_terminal()
        && std::env::var("TERM").is_ok_and(|term| term != "dumb")
        && std::env::var_os("NO_COLOR").is_none()
}

fn apply_style(text: &str, style: &Style, enabled: bool) -> String {
    if !enabled {
        return text.to_string();
    }

    let mut styled = String::with_capacity(text.len() + 20);
    let _ = write!(styled, "{style}");
    styled.push_str(text);
    let _ = write!(styled, "{}", style.render_reset());
    styled
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Applies the [`styles`] palette to text printed by the binary.
///
/// Styling is dropped when stdout is not an interactive terminal.
pub trait AnsiStyles {
    /// Header style, used for table headings.
    fn header(&self) -> String;

    /// Literal style, used for names of units, images and remotes.
    fn literal(&self) -> String;

    /// Placeholder style, used for values such as sizes and addresses.
    fn placeholder(&self) -> String;

    /// Error style.
    fn error(&self) -> String;

    /// Valid style, used for success markers and running states.
    fn valid(&self) -> String;
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<T: AsRef<str> + ?Sized> AnsiStyles for T {
    fn header(&self) -> String {
        apply_style(self.as_ref(), styles().get_header(), *IS_ANSI_TERMINAL)
    }

    fn literal(&self) -> String {
        apply_style(self.as_ref(), styles().get_literal(), *IS_ANSI_TERMINAL)
    }

    fn placeholder(&self) -> String {
        apply_style(self.as_ref(), styles().get_placeholder(), *IS_ANSI_TERMINAL)
    }

    fn error(&self) -> String {
        apply_style(self.as_ref(), styles().get_error(), *IS_ANSI_TERMINAL)
    }

    fn valid(&self) -> String {
        apply_style(self.as_ref(), styles().get_valid(), *IS_ANSI_TERMINAL)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_style_wraps_text() {
        let styled = apply_style("web", styles().get_header(), true);
        assert!(styled.contains("\x1b[1m"));
        assert!(styled.contains("\x1b[33m"));
        assert!(styled.contains("web"));
        assert!(styled.ends_with("\x1b[0m"));

        let placeholder = apply_style("10GB", styles().get_placeholder(), true);
        assert!(placeholder.contains("\x1b[32m"));
        assert!(!placeholder.contains("\x1b[1m"));
    }

    #[test]
    fn test_apply_style_disabled() {
        assert_eq!(apply_style("web", styles().get_error(), false), "web");
        assert_eq!(apply_style("", styles().get_valid(), false), "");
    }
}

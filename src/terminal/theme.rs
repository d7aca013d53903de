//! Terminal theme and color definitions

use crossterm::style::Color;

/// Colors for fragment output
pub struct Theme {
    /// Fragment titles and the banner
    pub title: Color,
    /// Generated text
    pub text: Color,
    /// Secondary info (ids, provider, hints)
    pub dim: Color,
    /// Stopped generations
    pub stopped: Color,
    /// Failed generations
    pub error: Color,
    /// Completed generations
    pub success: Color,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            title: Color::Magenta,
            text: Color::White,
            dim: Color::DarkGrey,
            stopped: Color::DarkYellow,
            error: Color::Red,
            success: Color::Green,
        }
    }
}

//! Console output icons.

use console::{style, StyledObject};

/// Success checkmark icon (green ✓).
pub fn success() -> StyledObject<&'static str> {
    style("✓").green()
}

/// Info arrow icon (cyan →).
pub fn info() -> StyledObject<&'static str> {
    style("→").cyan()
}

/// Error icon (red ✗).
pub fn error() -> StyledObject<&'static str> {
    style("✗").red()
}

/// Dim arrow for secondary info.
pub fn dim_arrow() -> StyledObject<&'static str> {
    style("→").dim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arrows_share_glyph() {
        assert_eq!(info().force_styling(false).to_string(), "→");
        assert_eq!(dim_arrow().force_styling(false).to_string(), "→");
        assert_ne!(
            info().force_styling(true).to_string(),
            dim_arrow().force_styling(true).to_string()
        );
    }
}

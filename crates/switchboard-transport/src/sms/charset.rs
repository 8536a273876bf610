//! Outbound SMS character-set validation.

use thiserror::Error;

/// Characters that take one septet.
const SINGLE_WIDTH_EXTRA: &str = "äöüÄÖÜàùòìèé§Ññ£$@ /?!#%&()*+,-:;<=>.\n\r";

/// Characters that are allowed but force the shorter message limit.
const DOUBLE_WIDTH: &str = "|{}[]€\\~^";

/// Maximum length when only single-width characters are used.
pub const SINGLE_WIDTH_MAX_LENGTH: usize = 160;

/// Maximum length once any double-width character appears.
pub const DOUBLE_WIDTH_MAX_LENGTH: usize = 70;

/// Content contains a character the provider cannot carry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal character {character:?} at position {position}")]
pub struct EncodingError {
    pub character: char,
    pub position: usize,
}

/// Length policy for validated content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharsetPolicy {
    SingleWidth,
    DoubleWidth,
}

impl CharsetPolicy {
    /// Maximum message length under this policy.
    #[must_use]
    pub const fn max_length(self) -> usize {
        match self {
            Self::SingleWidth => SINGLE_WIDTH_MAX_LENGTH,
            Self::DoubleWidth => DOUBLE_WIDTH_MAX_LENGTH,
        }
    }

    #[must_use]
    pub const fn is_reduced(self) -> bool {
        matches!(self, Self::DoubleWidth)
    }
}

fn is_single_width(c: char) -> bool {
    c.is_ascii_alphanumeric() || SINGLE_WIDTH_EXTRA.contains(c)
}

/// Check every character of `content` against the permitted sets.
///
/// # Errors
/// Returns `EncodingError` for the first character outside both sets.
pub fn validate_characters(content: &str) -> Result<CharsetPolicy, EncodingError> {
    let mut policy = CharsetPolicy::SingleWidth;
    for (position, character) in content.chars().enumerate() {
        if is_single_width(character) {
            continue;
        }
        if DOUBLE_WIDTH.contains(character) {
            policy = CharsetPolicy::DoubleWidth;
            continue;
        }
        return Err(EncodingError {
            character,
            position,
        });
    }
    Ok(policy)
}

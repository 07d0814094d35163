use std::collections::HashSet;

use unicode_segmentation::UnicodeSegmentation;

/// A host brings at most two guests; a party is never larger than 3 seats.
pub const MAX_GUESTS: usize = 2;

/// A guest's display name as supplied by the host. Rejects empty/whitespace,
/// enforces a maximum length, and rejects characters with markup or path
/// meaning.
///
/// Must be instantiated with `GuestName::parse`; the field is private so the
/// checks cannot be bypassed.
#[derive(Debug, Clone)]
pub struct GuestName(String);

impl GuestName {
    pub fn parse(name: String) -> Result<Self, String> {
        let name = name.trim().to_string();
        let empty = name.is_empty();
        let too_long = name.graphemes(true).count() > 100;
        let bad_chars: HashSet<char> = r#"/()"<>\{}"#.chars().collect();
        let bad = name.chars().any(|c| bad_chars.contains(&c));
        match !empty && !too_long && !bad {
            true => Ok(Self(name)),
            false => Err(format!("invalid guest name: {name:?}")),
        }
    }
}

impl AsRef<str> for GuestName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Server-authoritative guest list normalization: trim, drop blanks, cap at
/// `MAX_GUESTS`. The client-declared seat count is ignored for logic; the
/// party size is always `1 + normalized guest count`.
pub fn normalize_guests(names: &[String]) -> Vec<String> {
    names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .take(MAX_GUESTS)
        .map(str::to_string)
        .collect()
}

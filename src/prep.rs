//! RFC 4518 string preparation
//!
//! Matching rules compare *prepared* values, not raw octets. The pipeline is fixed by RFC 4518:
//! Transcode (here: UTF-8 validation) → Map (drop mapped-to-nothing code points, fold whitespace,
//! optionally case fold) → Normalize (NFKC) → Prohibit → Insignificant Character Handling. The
//! steps that vary per matching rule are expressed as [`PrepStep`] values carried by the rule.
//!
//! Values that are not valid UTF-8, or that contain prohibited code points, surface
//! [`PrepError`]; callers degrade to octet equality in that case (the server remains
//! authoritative for such attributes).

use unicode_normalization::UnicodeNormalization;

/// Per-rule variation points of the preparation pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepStep {
    /// Fold to lower case during the Map step (caseIgnore* rules)
    CaseFold,
    /// Collapse insignificant spaces (directory strings)
    SpaceInsignificant,
    /// Remove all spaces (numericString rules)
    NumericSquash,
    /// Telephone numbers: remove spaces and hyphens
    TelephoneSquash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PrepError {
    #[error("value is not valid UTF-8")]
    NotUtf8,
    #[error("value contains a prohibited code point")]
    Prohibited,
}

/// Run the full pipeline over an attribute or assertion value.
pub fn prepare(value: &[u8], steps: &[PrepStep]) -> Result<String, PrepError> {
    // Transcode
    let s = std::str::from_utf8(value).map_err(|_| PrepError::NotUtf8)?;

    let case_fold = steps.contains(&PrepStep::CaseFold);

    // Map
    let mut mapped = String::with_capacity(s.len());
    for c in s.chars() {
        if mapped_to_nothing(c) {
            continue;
        }
        let c = if mapped_to_space(c) { ' ' } else { c };
        if case_fold {
            for low in c.to_lowercase() {
                mapped.push(low);
            }
        } else {
            mapped.push(c);
        }
    }

    // Normalize
    let normalized: String = mapped.nfkc().collect();

    // Prohibit
    if normalized.chars().any(prohibited) {
        return Err(PrepError::Prohibited);
    }

    // Insignificant Character Handling
    let mut out = normalized;
    for step in steps {
        match step {
            PrepStep::SpaceInsignificant => out = squash_spaces(&out),
            PrepStep::NumericSquash => out.retain(|c| c != ' '),
            PrepStep::TelephoneSquash => out.retain(|c| c != ' ' && c != '-'),
            PrepStep::CaseFold => {}
        }
    }
    Ok(out)
}

/// Equality under a preparation pipeline, degrading to octet equality when preparation fails
/// for either operand.
pub fn equal(a: &[u8], b: &[u8], steps: &[PrepStep]) -> bool {
    match (prepare(a, steps), prepare(b, steps)) {
        (Ok(pa), Ok(pb)) => pa == pb,
        _ => a == b,
    }
}

/// Ordering comparison over prepared strings; `None` when preparation fails.
pub fn compare(a: &[u8], b: &[u8], steps: &[PrepStep]) -> Option<std::cmp::Ordering> {
    match (prepare(a, steps), prepare(b, steps)) {
        (Ok(pa), Ok(pb)) => Some(pa.cmp(&pb)),
        _ => None,
    }
}

/// Interior runs of SPACE collapse to one; leading and trailing spaces are insignificant.
fn squash_spaces(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending = false;
    for c in s.chars() {
        if c == ' ' {
            pending = !out.is_empty();
        } else {
            if pending {
                out.push(' ');
                pending = false;
            }
            out.push(c);
        }
    }
    out
}

// RFC 4518 section 2.2: characters mapped to nothing — soft hyphens, joiners, variation
// selectors, control characters and format characters without visual representation.
fn mapped_to_nothing(c: char) -> bool {
    matches!(c,
        '\u{00AD}' | '\u{1806}' | '\u{034F}'
        | '\u{180B}'..='\u{180E}'
        | '\u{FE00}'..='\u{FE0F}'
        | '\u{FFF9}'..='\u{FFFB}'
        | '\u{200B}'..='\u{200F}'
        | '\u{202A}'..='\u{202E}'
        | '\u{2060}'..='\u{2063}'
        | '\u{206A}'..='\u{206F}'
        | '\u{FEFF}'
        | '\u{0000}'..='\u{0008}'
        | '\u{000E}'..='\u{001F}'
        | '\u{007F}'..='\u{0084}'
        | '\u{0086}'..='\u{009F}'
        | '\u{06DD}' | '\u{070F}'
        | '\u{1D173}'..='\u{1D17A}'
        | '\u{E0001}'
        | '\u{E0020}'..='\u{E007F}'
    )
}

// RFC 4518 section 2.2: whitespace and space separators map to SPACE.
fn mapped_to_space(c: char) -> bool {
    matches!(c,
        '\u{0009}'..='\u{000D}' | '\u{0085}'
        | '\u{00A0}' | '\u{1680}'
        | '\u{2000}'..='\u{200A}'
        | '\u{2028}' | '\u{2029}'
        | '\u{202F}' | '\u{205F}' | '\u{3000}'
    )
}

// RFC 4518 section 2.4: private use, non-characters, the replacement character and
// deprecated format characters are prohibited.
fn prohibited(c: char) -> bool {
    let v = c as u32;
    matches!(c,
        '\u{E000}'..='\u{F8FF}'
        | '\u{F0000}'..='\u{FFFFD}'
        | '\u{100000}'..='\u{10FFFD}'
        | '\u{FDD0}'..='\u{FDEF}'
        | '\u{0340}' | '\u{0341}'
        | '\u{FFFD}'
    ) || (v & 0xFFFE) == 0xFFFE
}

#[cfg(test)]
mod tests {
    use super::*;

    const CASE_IGNORE: &[PrepStep] = &[PrepStep::CaseFold, PrepStep::SpaceInsignificant];

    #[test]
    fn test_case_fold_and_spaces() {
        assert_eq!(prepare(b"  Foo   BAR ", CASE_IGNORE).unwrap(), "foo bar");
        assert_eq!(prepare(b"foo bar", CASE_IGNORE).unwrap(), "foo bar");
        assert!(equal(b"Foo Bar", b"  foo   bar  ", CASE_IGNORE));
        assert!(!equal(b"foo", b"bar", CASE_IGNORE));
    }

    #[test]
    fn test_case_exact_keeps_case() {
        let exact = &[PrepStep::SpaceInsignificant];
        assert!(!equal(b"Foo", b"foo", exact));
        assert!(equal(b"Foo  Bar", b"Foo Bar", exact));
    }

    #[test]
    fn test_nfkc() {
        // U+FB01 LATIN SMALL LIGATURE FI normalises to "fi"
        assert!(equal("ﬁle".as_bytes(), b"file", CASE_IGNORE));
        // fullwidth forms
        assert!(equal("ＡＢＣ".as_bytes(), b"abc", CASE_IGNORE));
    }

    #[test]
    fn test_mapped_to_nothing() {
        assert!(equal("so\u{00AD}ft".as_bytes(), b"soft", CASE_IGNORE));
        assert!(equal("zero\u{200B}width".as_bytes(), b"zerowidth", CASE_IGNORE));
    }

    #[test]
    fn test_numeric_squash() {
        let numeric = &[PrepStep::NumericSquash];
        assert!(equal(b"123 456", b"123456", numeric));
    }

    #[test]
    fn test_prohibited_degrades_to_octets() {
        let private_use = "\u{E000}".as_bytes();
        assert!(prepare(private_use, CASE_IGNORE).is_err());
        // octet fallback still compares equal to itself
        assert!(equal(private_use, private_use, CASE_IGNORE));
    }

    #[test]
    fn test_non_utf8_degrades_to_octets() {
        assert!(prepare(&[0xff, 0xfe], CASE_IGNORE).is_err());
        assert!(equal(&[0xff, 0xfe], &[0xff, 0xfe], CASE_IGNORE));
        assert!(!equal(&[0xff, 0xfe], &[0xff, 0xff], CASE_IGNORE));
    }
}

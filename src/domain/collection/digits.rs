//! Keypad (DTMF) keys and entry validation

use serde::{Deserialize, Serialize};

/// One key on a telephone keypad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtmfKey {
    Zero,
    One,
    Two,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
    Nine,
    Star,
    Pound,
}

impl DtmfKey {
    /// Convert to character representation
    pub fn to_char(&self) -> char {
        match self {
            DtmfKey::Zero => '0',
            DtmfKey::One => '1',
            DtmfKey::Two => '2',
            DtmfKey::Three => '3',
            DtmfKey::Four => '4',
            DtmfKey::Five => '5',
            DtmfKey::Six => '6',
            DtmfKey::Seven => '7',
            DtmfKey::Eight => '8',
            DtmfKey::Nine => '9',
            DtmfKey::Star => '*',
            DtmfKey::Pound => '#',
        }
    }

    /// Parse from character
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(DtmfKey::Zero),
            '1' => Some(DtmfKey::One),
            '2' => Some(DtmfKey::Two),
            '3' => Some(DtmfKey::Three),
            '4' => Some(DtmfKey::Four),
            '5' => Some(DtmfKey::Five),
            '6' => Some(DtmfKey::Six),
            '7' => Some(DtmfKey::Seven),
            '8' => Some(DtmfKey::Eight),
            '9' => Some(DtmfKey::Nine),
            '*' => Some(DtmfKey::Star),
            '#' => Some(DtmfKey::Pound),
            _ => None,
        }
    }

    /// `*` and `#` carry structure, not value
    pub fn is_structural(&self) -> bool {
        matches!(self, DtmfKey::Star | DtmfKey::Pound)
    }

    /// `#` ends an entry early
    pub fn is_terminator(&self) -> bool {
        matches!(self, DtmfKey::Pound)
    }
}

/// Parse a keypad string, `None` if any character is not a keypad key
pub fn parse_keys(input: &str) -> Option<Vec<DtmfKey>> {
    input.chars().map(DtmfKey::from_char).collect()
}

/// Keep only the value-carrying digits of an entry
pub fn strip_structural(input: &str) -> String {
    input.chars().filter(|c| *c != '*' && *c != '#').collect()
}

/// An entry is valid iff it is only `0-9` (after removing `*`/`#`) and has
/// exactly `expected_length` digits.
pub fn validate(input: &str, expected_length: usize) -> bool {
    let Some(keys) = parse_keys(input) else {
        return false;
    };
    let digits = keys.iter().filter(|k| !k.is_structural()).count();
    digits == expected_length
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_conversion() {
        assert_eq!(DtmfKey::Zero.to_char(), '0');
        assert_eq!(DtmfKey::Nine.to_char(), '9');
        assert_eq!(DtmfKey::from_char('*'), Some(DtmfKey::Star));
        assert_eq!(DtmfKey::from_char('#'), Some(DtmfKey::Pound));
        assert_eq!(DtmfKey::from_char('x'), None);

        assert!(DtmfKey::Pound.is_terminator());
        assert!(!DtmfKey::Star.is_terminator());
        assert!(DtmfKey::Star.is_structural());
    }

    #[test]
    fn test_validate_exact_length() {
        assert!(validate("123456", 6));
        assert!(!validate("12345", 6));
        assert!(!validate("1234567", 6));
        assert!(validate("", 0));
    }

    #[test]
    fn test_validate_strips_structural_keys() {
        assert!(validate("123456#", 6));
        assert!(validate("*12*34#56", 6));
        assert!(!validate("####", 1));
    }

    #[test]
    fn test_validate_rejects_foreign_characters() {
        assert!(!validate("12a456", 6));
        assert!(!validate("123 456", 6));
        assert!(!validate("１２３４５６", 6));
    }

    #[test]
    fn test_validate_matches_digit_pattern() {
        // exhaustive over short strings built from a small alphabet
        let alphabet = ['0', '7', '*', '#', 'x'];
        let mut inputs = vec![String::new()];
        for _ in 0..4 {
            let mut next = Vec::new();
            for prefix in &inputs {
                for c in alphabet {
                    let mut s = prefix.clone();
                    s.push(c);
                    next.push(s);
                }
            }
            inputs.extend(next);
        }

        for input in inputs {
            let stripped = strip_structural(&input);
            for n in 0..5 {
                let expected =
                    stripped.len() == n && stripped.chars().all(|c| c.is_ascii_digit());
                assert_eq!(validate(&input, n), expected, "input {:?} n {}", input, n);
            }
        }
    }
}

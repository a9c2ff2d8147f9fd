//! 26-character sortable identifiers.
//!
//! Every aggregate is identified by a UUIDv7 rendered as 26 characters of
//! Crockford base32. The v7 layout puts a 48-bit unix-millisecond timestamp
//! in the most significant bits, so the textual form sorts in creation order
//! under plain byte comparison. The rendering is case-insensitive on input
//! and always upper-case on output.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

/// Crockford base32 alphabet: no I, L, O, U.
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// UUIDv7 orders by its millisecond timestamp but makes no promise within
/// one millisecond. This guard makes generation strictly increasing
/// process-wide, which `ORDER BY id` relies on.
static LAST_GENERATED: Mutex<u128> = Mutex::new(0);

fn next_value() -> [u8; 16] {
    let candidate = u128::from_be_bytes(*uuid::Uuid::now_v7().as_bytes());
    let mut last = LAST_GENERATED.lock().unwrap_or_else(|p| p.into_inner());
    let value = if candidate > *last { candidate } else { *last + 1 };
    *last = value;
    value.to_be_bytes()
}

/// Encode 16 bytes as 26 Crockford base32 characters (130 bits, top 2 zero).
fn encode(bytes: [u8; 16]) -> String {
    let value = u128::from_be_bytes(bytes);
    let mut out = String::with_capacity(26);
    for i in 0..26 {
        let shift = 5 * (25 - i);
        let index = ((value >> shift) & 0x1f) as usize;
        out.push(ALPHABET[index] as char);
    }
    out
}

/// Decode 26 Crockford base32 characters back to 16 bytes.
///
/// Accepts lower-case input. Rejects wrong lengths, characters outside the
/// alphabet, and values that overflow 128 bits (first character above `7`).
fn decode(text: &str) -> Result<[u8; 16], IdError> {
    let raw = text.as_bytes();
    if raw.len() != 26 {
        return Err(IdError::Length(raw.len()));
    }
    let mut value: u128 = 0;
    for (pos, &c) in raw.iter().enumerate() {
        let c = c.to_ascii_uppercase();
        let digit = ALPHABET
            .iter()
            .position(|&a| a == c)
            .ok_or(IdError::Character(c as char))? as u128;
        if pos == 0 && digit > 7 {
            return Err(IdError::Overflow);
        }
        value = (value << 5) | digit;
    }
    Ok(value.to_be_bytes())
}

/// Invalid identifier text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("identifier must be 26 characters, got {0}")]
    Length(usize),
    #[error("identifier contains invalid character {0:?}")]
    Character(char),
    #[error("identifier overflows 128 bits")]
    Overflow,
}

macro_rules! sortable_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; 16]);

        impl $name {
            /// Generate a new time-ordered identifier.
            pub fn generate() -> Self {
                Self(next_value())
            }

            /// The canonical 26-character textual form.
            pub fn to_text(&self) -> String {
                encode(self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, IdError> {
                decode(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_text())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.to_text())
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_text())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                text.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

sortable_id!(
    /// Identifier of a campaign aggregate.
    CampaignId
);
sortable_id!(
    /// Identifier of a place-extraction task.
    TaskId
);
sortable_id!(
    /// Identifier of an extracted place.
    PlaceId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_26_chars() {
        let id = CampaignId::generate();
        assert_eq!(id.to_text().len(), 26);
    }

    #[test]
    fn text_round_trips() {
        let id = TaskId::generate();
        let parsed: TaskId = id.to_text().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn lower_case_input_is_accepted() {
        let id = PlaceId::generate();
        let parsed: PlaceId = id.to_text().to_lowercase().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn successive_ids_sort_in_generation_order() {
        // UUIDv7 embeds a millisecond timestamp plus a monotonic counter, so
        // textual order must follow generation order.
        let mut previous = CampaignId::generate();
        for _ in 0..100 {
            let next = CampaignId::generate();
            assert!(next.to_text() > previous.to_text());
            previous = next;
        }
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!("ABC".parse::<TaskId>(), Err(IdError::Length(3)));
    }

    #[test]
    fn rejects_excluded_characters() {
        let bad = "0IL0000000000000000000000O";
        assert!(matches!(bad.parse::<TaskId>(), Err(IdError::Character(_))));
    }

    #[test]
    fn rejects_overflowing_first_character() {
        let bad = "Z0000000000000000000000000";
        assert_eq!(bad.parse::<TaskId>(), Err(IdError::Overflow));
    }

    #[test]
    fn serde_uses_textual_form() {
        let id = CampaignId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_text()));
        let back: CampaignId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}

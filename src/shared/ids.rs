use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const RUN_SUFFIX_WIDTH: usize = 4;
const RUN_SUFFIX_SPACE: u32 = 36 * 36 * 36 * 36;

pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | ':'))
    {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-', '_', '.' or ':'"
    ))
}

macro_rules! define_id_type {
    ($name:ident, $kind:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> Result<Self, String> {
                validate_identifier_value($kind, raw)?;
                Ok(Self(raw.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                self.as_str()
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                Self::parse(&raw).map_err(|err| {
                    D::Error::custom(format!("invalid {} `{}`: {}", $kind, raw, err))
                })
            }
        }
    };
}

define_id_type!(RunId, "run id");

/// Compact run id: `run-<base36 unix seconds>-<4 random base36 chars>`.
pub fn generate_run_id(now_secs: i64) -> Result<RunId, String> {
    let timestamp = u64::try_from(now_secs)
        .map_err(|_| "run id generation requires a non-negative timestamp".to_string())?;
    let mut bytes = [0_u8; 4];
    getrandom::getrandom(&mut bytes)
        .map_err(|err| format!("failed to generate run id randomness: {err}"))?;
    let sample = u32::from_le_bytes(bytes) % RUN_SUFFIX_SPACE;
    RunId::parse(&format!(
        "run-{}-{}",
        base36_encode_u64(timestamp),
        base36_encode_fixed_u32(sample, RUN_SUFFIX_WIDTH)
    ))
}

fn base36_encode_u64(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut chars = Vec::new();
    while value > 0 {
        chars.push(BASE36_ALPHABET[(value % 36) as usize] as char);
        value /= 36;
    }
    chars.iter().rev().collect()
}

fn base36_encode_fixed_u32(mut value: u32, width: usize) -> String {
    let mut chars = vec!['0'; width];
    for idx in (0..width).rev() {
        chars[idx] = BASE36_ALPHABET[(value % 36) as usize] as char;
        value /= 36;
    }
    chars.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_rejects_whitespace_and_empty_values() {
        assert!(RunId::parse("").is_err());
        assert!(RunId::parse("run 1").is_err());
        assert!(RunId::parse("run-abc_1.x").is_ok());
    }

    #[test]
    fn generated_run_ids_use_compact_base36_layout() {
        let run_id = generate_run_id(1_700_000_000).expect("run id");
        let parts: Vec<&str> = run_id.as_str().split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "run");
        assert_eq!(parts[1], base36_encode_u64(1_700_000_000));
        assert_eq!(parts[2].len(), RUN_SUFFIX_WIDTH);
    }

    #[test]
    fn negative_timestamps_are_rejected() {
        assert!(generate_run_id(-1).is_err());
    }
}

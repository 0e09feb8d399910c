//! Declarative string encoding for tagged enums.
//!
//! Each enum declares one mapping table; encoding, decoding, `Display`,
//! `FromStr` and serde all go through the same two generic functions.

use crate::error::DomainError;

/// An enum with a fixed, declared string representation per variant.
pub trait StringEnum: Sized + Copy + PartialEq + 'static {
    /// Human-readable name used in decode errors.
    const KIND: &'static str;
    /// Variant ↔ wire string table. The first entry for a variant is canonical.
    const TABLE: &'static [(Self, &'static str)];

    fn as_str(self) -> &'static str {
        encode(self)
    }
}

/// Encode a variant using its declared table.
pub fn encode<E: StringEnum>(value: E) -> &'static str {
    E::TABLE
        .iter()
        .find(|(variant, _)| *variant == value)
        .map(|(_, s)| *s)
        .unwrap_or("")
}

/// Decode a wire string using the declared table.
///
/// Exact matches win; otherwise an ASCII case-insensitive match is accepted.
pub fn decode<E: StringEnum>(raw: &str) -> Result<E, DomainError> {
    let raw = raw.trim();
    E::TABLE
        .iter()
        .find(|(_, s)| *s == raw)
        .or_else(|| E::TABLE.iter().find(|(_, s)| s.eq_ignore_ascii_case(raw)))
        .map(|(variant, _)| *variant)
        .ok_or_else(|| DomainError::unknown_variant(E::KIND, raw))
}

/// Implement [`StringEnum`], `Display`, `FromStr`, `Serialize` and `Deserialize`
/// for a fieldless enum from a single mapping table.
#[macro_export]
macro_rules! string_enum {
    ($t:ty, $kind:literal, [$(($variant:expr, $s:literal)),+ $(,)?]) => {
        impl $crate::codec::StringEnum for $t {
            const KIND: &'static str = $kind;
            const TABLE: &'static [(Self, &'static str)] = &[$(($variant, $s)),+];
        }

        impl ::core::fmt::Display for $t {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.write_str($crate::codec::encode(*self))
            }
        }

        impl ::core::str::FromStr for $t {
            type Err = $crate::error::DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $crate::codec::decode(s)
            }
        }

        impl ::serde::Serialize for $t {
            fn serialize<S: ::serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str($crate::codec::encode(*self))
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $t {
            fn deserialize<D: ::serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = <String as ::serde::Deserialize>::deserialize(deserializer)?;
                $crate::codec::decode(&raw).map_err(<D::Error as ::serde::de::Error>::custom)
            }
        }
    };
}

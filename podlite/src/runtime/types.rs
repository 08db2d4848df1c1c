//! Identifier types for containers and pods.

use std::fmt;
use std::str::FromStr;

use podlite_shared::errors::PodliteError;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Hex characters in a full ID.
pub const ID_LEN: usize = 64;

/// Prefix used for display, default hostnames and generated names.
pub const SHORT_ID_LEN: usize = 12;

/// 32 random bytes as lowercase hex. An ID made only of digits could be
/// mistaken for a number by tooling, so those are drawn again.
fn random_hex_id() -> String {
    let mut rng = rand::rng();
    loop {
        let mut bytes = [0u8; ID_LEN / 2];
        rng.fill_bytes(&mut bytes);
        let id = hex::encode(bytes);
        if !id.bytes().all(|b| b.is_ascii_digit()) {
            return id;
        }
    }
}

fn is_hex_id(s: &str) -> bool {
    s.len() == ID_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(random_hex_id())
            }

            /// `None` unless `s` is 64 lowercase hex characters.
            pub fn parse(s: &str) -> Option<Self> {
                is_hex_id(s).then(|| Self(s.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn short(&self) -> &str {
                &self.0[..SHORT_ID_LEN]
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl FromStr for $name {
            type Err = PodliteError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s).ok_or_else(|| {
                    PodliteError::InvalidArgument(format!(
                        "{:?} is not a valid {}",
                        s,
                        stringify!($name)
                    ))
                })
            }
        }

        impl TryFrom<String> for $name {
            type Error = PodliteError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl rusqlite::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.0.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: PodliteError| rusqlite::types::FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

hex_id! {
    /// Container identifier.
    ///
    /// ```
    /// use podlite::ContainerID;
    ///
    /// let id = ContainerID::new();
    /// assert!(id.as_str().starts_with(id.short()));
    /// ```
    ContainerID
}

hex_id! {
    /// Pod identifier. Pods and containers share one ID namespace.
    PodID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_well_formed() {
        for _ in 0..32 {
            let id = ContainerID::new();
            assert!(is_hex_id(id.as_str()), "{}", id);
            assert!(!id.as_str().bytes().all(|b| b.is_ascii_digit()));
        }
        assert_ne!(PodID::new(), PodID::new());
    }

    #[test]
    fn parsing_rejects_malformed_ids() {
        let digits = "7".repeat(ID_LEN);
        assert!(ContainerID::parse(&digits).is_some());
        assert!(ContainerID::parse("deadbeef").is_none());
        assert!(ContainerID::parse(&"F".repeat(ID_LEN)).is_none());
        assert!("zz".parse::<PodID>().is_err());
    }

    #[test]
    fn serde_checks_the_format() {
        let id = ContainerID::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        assert_eq!(serde_json::from_str::<ContainerID>(&json).unwrap(), id);
        assert!(serde_json::from_str::<ContainerID>("\"short\"").is_err());
    }

    #[test]
    fn debug_shows_short_form() {
        let id = PodID::new();
        assert_eq!(format!("{:?}", id), format!("PodID({})", id.short()));
    }
}

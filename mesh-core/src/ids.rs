//! Identifiers: session ids and short codes, client ids, transfer ids, roles.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Alphabet for human-typed session codes. Ambiguous glyphs (I, O, 0, 1) are excluded.
pub const SESSION_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of a generated session code.
pub const SESSION_CODE_LEN: usize = 6;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Opaque session id, shared by both participants through the relay.
    SessionId
);
string_id!(
    /// Participant id announced in `join` and listed in roster pushes.
    ClientId
);
string_id!(
    /// Identifies one file transfer in both directions.
    TransferId
);

impl SessionId {
    /// Random UUID session id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Short code a person can read out or type, e.g. `K7QM2X`.
    pub fn generate_code() -> Self {
        let mut rng = rand::thread_rng();
        let code: String = (0..SESSION_CODE_LEN)
            .map(|_| SESSION_CODE_ALPHABET[rng.gen_range(0..SESSION_CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }
}

impl ClientId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl TransferId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Who created the session. The joiner is the polite peer during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Joiner,
}

impl Role {
    /// Polite peers yield their own offer when a remote offer collides with it.
    pub fn is_polite(self) -> bool {
        matches!(self, Role::Joiner)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Joiner => f.write_str("joiner"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_code_uses_unambiguous_alphabet() {
        for _ in 0..50 {
            let code = SessionId::generate_code();
            assert_eq!(code.as_str().len(), SESSION_CODE_LEN);
            assert!(code
                .as_str()
                .bytes()
                .all(|b| SESSION_CODE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(ClientId::generate(), ClientId::generate());
        assert_ne!(TransferId::generate(), TransferId::generate());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = ClientId::from("peer-a");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"peer-a\"");
        let back: ClientId = serde_json::from_str("\"peer-a\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn joiner_is_polite() {
        assert!(Role::Joiner.is_polite());
        assert!(!Role::Initiator.is_polite());
        assert_eq!(serde_json::to_string(&Role::Initiator).unwrap(), "\"initiator\"");
    }
}

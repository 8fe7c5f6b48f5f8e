//! Room codes and rider roles.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Prefix shared by every room code, separator included.
pub const ROOM_CODE_PREFIX: &str = "TNDM-";

/// Number of random characters after the prefix.
pub const ROOM_CODE_SUFFIX_LEN: usize = 4;

/// Suffix alphabet. 0/O and 1/I are left out so codes can be read aloud and typed.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Which seat on the tandem a client controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Front rider. Runs the authoritative physics and hosts the room.
    Captain,
    /// Rear rider. Joins the Captain's room.
    Stoker,
}

impl Role {
    /// Lowercase name used in relay connection parameters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Captain => "captain",
            Role::Stoker => "stoker",
        }
    }

    pub fn partner(&self) -> Role {
        match self {
            Role::Captain => Role::Stoker,
            Role::Stoker => Role::Captain,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Captain => write!(f, "Captain"),
            Role::Stoker => write!(f, "Stoker"),
        }
    }
}

/// Human-typable room identifier, also used verbatim as the Captain's primary address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    /// Draw a fresh random code.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let suffix: String = (0..ROOM_CODE_SUFFIX_LEN)
            .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
            .collect();
        Self(format!("{}{}", ROOM_CODE_PREFIX, suffix))
    }

    /// Parse user input. Surrounding whitespace and letter case are ignored.
    pub fn parse(input: &str) -> Result<Self, RoomCodeError> {
        let code = input.trim().to_ascii_uppercase();

        let suffix = code
            .strip_prefix(ROOM_CODE_PREFIX)
            .ok_or(RoomCodeError::MissingPrefix)?;

        if suffix.len() != ROOM_CODE_SUFFIX_LEN {
            return Err(RoomCodeError::WrongLength(suffix.len()));
        }

        if let Some(bad) = suffix
            .chars()
            .find(|c| !c.is_ascii() || !ROOM_CODE_ALPHABET.contains(&(*c as u8)))
        {
            return Err(RoomCodeError::InvalidCharacter(bad));
        }

        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The random part after the prefix.
    pub fn suffix(&self) -> &str {
        &self.0[ROOM_CODE_PREFIX.len()..]
    }
}

impl std::fmt::Display for RoomCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for RoomCode {
    type Err = RoomCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomCode {
    type Error = RoomCodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

/// Room code parse errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomCodeError {
    #[error("Room code must start with {}", ROOM_CODE_PREFIX)]
    MissingPrefix,

    #[error("Room code needs {} characters after the prefix, got {0}", ROOM_CODE_SUFFIX_LEN)]
    WrongLength(usize),

    #[error("Room code contains invalid character '{0}'")]
    InvalidCharacter(char),
}

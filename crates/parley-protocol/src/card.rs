//! Planning poker cards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// A card from the fixed planning poker deck.
///
/// Serialized as its face value string (`"1"`, `"13"`, `"?"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PokerCard {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "2")]
    Two,
    #[serde(rename = "3")]
    Three,
    #[serde(rename = "5")]
    Five,
    #[serde(rename = "8")]
    Eight,
    #[serde(rename = "13")]
    Thirteen,
    /// "I have no idea"
    #[serde(rename = "?")]
    Unsure,
}

impl PokerCard {
    /// The full deck in display order.
    pub const ALL: [PokerCard; 7] = [
        PokerCard::One,
        PokerCard::Two,
        PokerCard::Three,
        PokerCard::Five,
        PokerCard::Eight,
        PokerCard::Thirteen,
        PokerCard::Unsure,
    ];

    /// Face value as shown on the card.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::One => "1",
            Self::Two => "2",
            Self::Three => "3",
            Self::Five => "5",
            Self::Eight => "8",
            Self::Thirteen => "13",
            Self::Unsure => "?",
        }
    }

    /// Numeric estimate, `None` for the `?` card.
    pub fn points(&self) -> Option<u32> {
        match self {
            Self::One => Some(1),
            Self::Two => Some(2),
            Self::Three => Some(3),
            Self::Five => Some(5),
            Self::Eight => Some(8),
            Self::Thirteen => Some(13),
            Self::Unsure => None,
        }
    }
}

impl fmt::Display for PokerCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PokerCard {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|card| card.as_str() == s)
            .ok_or_else(|| ProtocolError::Malformed(format!("not a poker card: {s:?}")))
    }
}

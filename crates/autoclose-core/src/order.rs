//! Order-related types and identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Parse the lowercase persisted form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" | "long" => Some(Self::Buy),
            "sell" | "short" => Some(Self::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client order ID used to tag reduce orders.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Generate a new random client order ID.
    ///
    /// Uses the 32-character simple UUID form, which fits the length limit
    /// most venues put on client order IDs.
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientOrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_side_parse_roundtrip() {
        assert_eq!(OrderSide::parse("buy"), Some(OrderSide::Buy));
        assert_eq!(OrderSide::parse("short"), Some(OrderSide::Sell));
        assert_eq!(OrderSide::parse("flat"), None);
        assert_eq!(OrderSide::Sell.to_string(), "sell");
    }

    #[test]
    fn test_client_order_id_unique() {
        let a = ClientOrderId::new();
        let b = ClientOrderId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }
}

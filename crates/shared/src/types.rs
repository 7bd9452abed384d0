//! Common types used across Rebill

use serde::{Deserialize, Serialize};

/// Subscription plan tier, ordered cheapest to most expensive.
///
/// The derived `Ord` follows declaration order, so `Plan::Basic < Plan::Premium`
/// holds and downgrades can be detected by comparison.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Basic,
    Standard,
    Premium,
}

impl Plan {
    /// Monthly price in cents
    pub fn monthly_price_cents(&self) -> i64 {
        match self {
            Self::Basic => 499,
            Self::Standard => 999,
            Self::Premium => 1999,
        }
    }

    /// Monthly scan quota included with this plan
    pub fn monthly_quota(&self) -> i32 {
        match self {
            Self::Basic => 50,
            Self::Standard => 250,
            Self::Premium => 1000,
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::Standard => write!(f, "standard"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

/// Subscription lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    ExpiringSoon,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    /// Whether a renewal charge may be attempted in this status
    pub fn is_renewable(&self) -> bool {
        matches!(self, Self::Active | Self::ExpiringSoon)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trial => write!(f, "trial"),
            Self::Active => write!(f, "active"),
            Self::ExpiringSoon => write!(f, "expiring_soon"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Payment rail an instrument is charged through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    Card,
    MobileMoney,
}

impl std::str::FromStr for GatewayKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "card" => Ok(Self::Card),
            "mobile_money" => Ok(Self::MobileMoney),
            other => Err(format!("unknown gateway: {other}")),
        }
    }
}

impl std::fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Card => write!(f, "card"),
            Self::MobileMoney => write!(f, "mobile_money"),
        }
    }
}

/// Kind of ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Charge,
    Refund,
}

/// Ledger entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Succeeded,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_ordering() {
        assert!(Plan::Basic < Plan::Standard);
        assert!(Plan::Standard < Plan::Premium);
    }

    #[test]
    fn test_plan_pricing_monotonic() {
        assert!(Plan::Basic.monthly_price_cents() < Plan::Standard.monthly_price_cents());
        assert!(Plan::Standard.monthly_price_cents() < Plan::Premium.monthly_price_cents());
    }

    #[test]
    fn test_renewable_statuses() {
        assert!(SubscriptionStatus::Active.is_renewable());
        assert!(SubscriptionStatus::ExpiringSoon.is_renewable());
        assert!(!SubscriptionStatus::Cancelled.is_renewable());
        assert!(!SubscriptionStatus::Expired.is_renewable());
        assert!(!SubscriptionStatus::Trial.is_renewable());
    }

    #[test]
    fn test_gateway_round_trip() {
        for g in [GatewayKind::Card, GatewayKind::MobileMoney] {
            let parsed: GatewayKind = g.to_string().parse().unwrap();
            assert_eq!(parsed, g);
        }
        assert!("paypal".parse::<GatewayKind>().is_err());
    }
}

// Domain type definitions for the loyalty ledger
// Shared enums used by the calculator, the ledger and the order lifecycle

use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// Kind of ledger movement
///
/// The sign of an entry's delta always follows from its type: earn,
/// admin_add and refund_reversal credit the account; redeem, admin_deduct
/// and expire debit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Points awarded for a completed order
    Earn,

    /// Points spent as a checkout discount
    Redeem,

    /// Manual credit by an administrator
    AdminAdd,

    /// Manual debit by an administrator
    AdminDeduct,

    /// Points earned on an order that was later cancelled or refunded
    RefundReversal,

    /// Points removed by the expiry sweep
    Expire,
}

impl EntryType {
    pub const ALL: [EntryType; 6] = [
        EntryType::Earn,
        EntryType::Redeem,
        EntryType::AdminAdd,
        EntryType::AdminDeduct,
        EntryType::RefundReversal,
        EntryType::Expire,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Earn => "earn",
            EntryType::Redeem => "redeem",
            EntryType::AdminAdd => "admin_add",
            EntryType::AdminDeduct => "admin_deduct",
            EntryType::RefundReversal => "refund_reversal",
            EntryType::Expire => "expire",
        }
    }

    /// Human-readable label shown in account history and the admin listing
    pub fn label(&self) -> &'static str {
        match self {
            EntryType::Earn => "Earned",
            EntryType::Redeem => "Redeemed",
            EntryType::AdminAdd => "Admin Add",
            EntryType::AdminDeduct => "Admin Deduct",
            EntryType::RefundReversal => "Refund/Cancel",
            EntryType::Expire => "Expired",
        }
    }

    /// Whether entries of this type add points to the account
    pub fn is_credit(&self) -> bool {
        matches!(
            self,
            EntryType::Earn | EntryType::AdminAdd | EntryType::RefundReversal
        )
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "earn" => Ok(EntryType::Earn),
            "redeem" => Ok(EntryType::Redeem),
            "admin_add" => Ok(EntryType::AdminAdd),
            "admin_deduct" => Ok(EntryType::AdminDeduct),
            "refund_reversal" => Ok(EntryType::RefundReversal),
            "expire" => Ok(EntryType::Expire),
            _ => Err(format!("Invalid entry type: {}", s)),
        }
    }
}

/// How fractional point amounts become whole points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    #[default]
    Floor,
    /// Half away from zero
    Round,
    Ceil,
}

impl fmt::Display for RoundingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundingMode::Floor => write!(f, "floor"),
            RoundingMode::Round => write!(f, "round"),
            RoundingMode::Ceil => write!(f, "ceil"),
        }
    }
}

impl std::str::FromStr for RoundingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "floor" => Ok(RoundingMode::Floor),
            "round" => Ok(RoundingMode::Round),
            "ceil" => Ok(RoundingMode::Ceil),
            _ => Err(format!("Invalid rounding mode: {}", s)),
        }
    }
}

/// Order status on which points are awarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AwardStatus {
    #[default]
    Completed,
    Processing,
}

impl AwardStatus {
    pub fn order_status(&self) -> OrderStatus {
        match self {
            AwardStatus::Completed => OrderStatus::Completed,
            AwardStatus::Processing => OrderStatus::Processing,
        }
    }
}

impl fmt::Display for AwardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.order_status())
    }
}

impl std::str::FromStr for AwardStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(AwardStatus::Completed),
            "processing" => Ok(AwardStatus::Processing),
            _ => Err(format!("Invalid award status: {}", s)),
        }
    }
}

/// Status vocabulary of the storefront's order subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Processing,
    OnHold,
    Completed,
    Cancelled,
    Refunded,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::OnHold => "on_hold",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
            OrderStatus::Failed => "failed",
        }
    }

    /// Statuses that take back points earned on the order
    pub fn is_reversal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Cancelled | OrderStatus::Refunded | OrderStatus::Failed
        )
    }

    /// Statuses that confirm a pending redemption
    pub fn confirms_payment(&self) -> bool {
        matches!(self, OrderStatus::Processing | OrderStatus::Completed)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "processing" => Ok(OrderStatus::Processing),
            "on_hold" | "on-hold" => Ok(OrderStatus::OnHold),
            "completed" => Ok(OrderStatus::Completed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "refunded" => Ok(OrderStatus::Refunded),
            "failed" => Ok(OrderStatus::Failed),
            _ => Err(format!("Invalid order status: {}", s)),
        }
    }
}

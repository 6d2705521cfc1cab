use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::errors::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Mpesa,
    Airtel,
    Stripe,
    #[serde(rename = "cod")]
    CashOnDelivery,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Mpesa => "mpesa",
            PaymentMethod::Airtel => "airtel",
            PaymentMethod::Stripe => "stripe",
            PaymentMethod::CashOnDelivery => "cod",
        }
    }

    /// Pay-now methods collect money before fulfilment; the order stays
    /// pending until a provider callback confirms it.
    pub fn is_pay_now(&self) -> bool {
        !matches!(self, PaymentMethod::CashOnDelivery)
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mpesa" => Ok(PaymentMethod::Mpesa),
            "airtel" => Ok(PaymentMethod::Airtel),
            "stripe" => Ok(PaymentMethod::Stripe),
            "cod" => Ok(PaymentMethod::CashOnDelivery),
            other => Err(DomainError::InvalidInput(format!("unknown payment method '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "processing" => Ok(PaymentStatus::Processing),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            other => Err(DomainError::Internal(format!("unknown payment status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub id: Uuid,
    pub order_id: Option<Uuid>,
    pub provider: PaymentMethod,
    pub provider_reference: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub payer_contact: Option<String>,
    pub failure_reason: Option<String>,
    pub raw_payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Option<Uuid>,
    pub provider: PaymentMethod,
    pub provider_reference: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub payer_contact: Option<String>,
    pub receipt: Option<String>,
    pub failure_reason: Option<String>,
    pub raw_payload: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Which provider field carries the value used to match a callback to the
/// payment recorded at initiation. The same field is stored as
/// `provider_reference` when the payment is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationKey {
    /// M-Pesa `CheckoutRequestID` from the STK push response.
    CheckoutRequestId,
    /// Client-generated transaction id echoed back by Airtel.
    TransactionId,
    /// Stripe PaymentIntent id.
    PaymentIntentId,
    /// Locally generated; no callbacks exist.
    LocalReference,
}

impl CorrelationKey {
    pub fn field_name(&self) -> &'static str {
        match self {
            CorrelationKey::CheckoutRequestId => "CheckoutRequestID",
            CorrelationKey::TransactionId => "transaction.id",
            CorrelationKey::PaymentIntentId => "data.object.id",
            CorrelationKey::LocalReference => "reference",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallbackResult {
    Succeeded {
        amount: Option<BigDecimal>,
        receipt: Option<String>,
    },
    Failed {
        reason: String,
    },
}

/// A provider callback reduced to what reconciliation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackOutcome {
    pub provider: PaymentMethod,
    pub reference: String,
    /// Payment id echoed back by providers that carry our metadata. Used when
    /// the callback arrives before the provider reference has been stored.
    pub attempt_id: Option<Uuid>,
    pub result: CallbackResult,
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub enum SettlementKind {
    Completed { receipt: Option<String> },
    Failed { reason: String },
}

impl SettlementKind {
    /// Statuses this settlement may move a payment out of. Money that arrives
    /// for a cancelled attempt is still recorded.
    pub fn settles_from(&self) -> &'static [PaymentStatus] {
        match self {
            SettlementKind::Completed { .. } => &[
                PaymentStatus::Pending,
                PaymentStatus::Processing,
                PaymentStatus::Cancelled,
            ],
            SettlementKind::Failed { .. } => &[PaymentStatus::Pending, PaymentStatus::Processing],
        }
    }

    pub fn applies_to(&self, status: PaymentStatus) -> bool {
        self.settles_from().contains(&status)
    }
}

/// One terminal transition for a payment, applied together with its effect on
/// the owning order.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub payment_id: Uuid,
    pub kind: SettlementKind,
    pub raw_payload: Value,
    pub at: DateTime<Utc>,
}

/// What the provider said about an attempt that was recorded before it was
/// asked.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Accepted { raw: Value },
    Rejected { reason: String },
}

#[derive(Debug, Clone)]
pub struct AttemptUpdate {
    pub reference: String,
    pub contact: Option<String>,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone)]
pub enum SettleResult {
    Applied(Payment),
    /// The payment had already reached a terminal state; nothing was written.
    AlreadyTerminal(Payment),
}

use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde_json::json;
use uuid::Uuid;

use crate::db::DbPool;
use crate::domain::errors::DomainError;
use crate::domain::order::{OrderPaymentStatus, OrderStatus};
use crate::domain::payment::{
    AttemptOutcome, AttemptUpdate, NewPayment, Payment, PaymentMethod, PaymentStatus,
    SettleResult, Settlement, SettlementKind,
};
use crate::domain::ports::PaymentRepository;
use crate::schema::{orders, payments};

use super::models::{NewPaymentRow, PaymentRow};
use super::order_repo::{append_history, record_event};

pub(super) const OPEN_STATUSES: [&str; 2] = ["pending", "processing"];

pub struct DieselPaymentRepository {
    pool: DbPool,
}

impl DieselPaymentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Marks the owning order paid. A cancelled order keeps its status; the
/// money is still recorded against it.
fn mark_order_paid(
    conn: &mut PgConnection,
    order_id: Uuid,
    payment: &Payment,
    at: DateTime<Utc>,
) -> Result<(), DomainError> {
    let status: Option<String> = orders::table
        .find(order_id)
        .select(orders::status)
        .for_update()
        .first(conn)
        .optional()?;
    let Some(status) = status else {
        return Ok(());
    };

    diesel::update(orders::table.find(order_id))
        .set((
            orders::payment_status.eq(OrderPaymentStatus::Paid.as_str()),
            orders::paid_at.eq(Some(at)),
            orders::payment_reference.eq(Some(payment.provider_reference.as_str())),
            orders::updated_at.eq(at),
        ))
        .execute(conn)?;
    if status == OrderStatus::Pending.as_str() {
        diesel::update(orders::table.find(order_id))
            .set(orders::status.eq(OrderStatus::Confirmed.as_str()))
            .execute(conn)?;
        append_history(
            conn,
            order_id,
            OrderStatus::Confirmed,
            Some(format!("payment received via {}", payment.provider)),
            at,
        )?;
    }
    Ok(())
}

impl PaymentRepository for DieselPaymentRepository {
    fn insert(&self, payment: NewPayment) -> Result<Payment, DomainError> {
        let mut conn = self.pool.get()?;
        let row = diesel::insert_into(payments::table)
            .values(&NewPaymentRow {
                id: payment.id,
                order_id: payment.order_id,
                provider: payment.provider.to_string(),
                provider_reference: payment.provider_reference,
                amount: payment.amount,
                currency: payment.currency,
                status: payment.status.to_string(),
                payer_contact: payment.payer_contact,
                failure_reason: payment.failure_reason,
                raw_payload: payment.raw_payload,
            })
            .returning(PaymentRow::as_returning())
            .get_result(&mut conn)?;
        Payment::try_from(row)
    }

    fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>, DomainError> {
        let mut conn = self.pool.get()?;
        payments::table
            .find(id)
            .select(PaymentRow::as_select())
            .first(&mut conn)
            .optional()?
            .map(Payment::try_from)
            .transpose()
    }

    fn find_by_reference(
        &self,
        provider: PaymentMethod,
        reference: &str,
    ) -> Result<Option<Payment>, DomainError> {
        let mut conn = self.pool.get()?;
        payments::table
            .filter(payments::provider.eq(provider.as_str()))
            .filter(payments::provider_reference.eq(reference))
            .select(PaymentRow::as_select())
            .first(&mut conn)
            .optional()?
            .map(Payment::try_from)
            .transpose()
    }

    fn update_attempt(&self, id: Uuid, update: AttemptUpdate) -> Result<Payment, DomainError> {
        let mut conn = self.pool.get()?;

        conn.transaction::<_, DomainError, _>(|conn| {
            let now = Utc::now();
            let touched = diesel::update(payments::table.find(id))
                .set((
                    payments::provider_reference.eq(update.reference.as_str()),
                    payments::updated_at.eq(now),
                ))
                .execute(conn)?;
            if touched == 0 {
                return Err(DomainError::NotFound);
            }
            if let Some(contact) = &update.contact {
                diesel::update(payments::table.find(id))
                    .set(payments::payer_contact.eq(Some(contact.as_str())))
                    .execute(conn)?;
            }

            // A callback may already have settled the attempt.
            let processing = payments::table
                .filter(payments::id.eq(id))
                .filter(payments::status.eq(PaymentStatus::Processing.as_str()));
            match &update.outcome {
                AttemptOutcome::Accepted { raw } => diesel::update(processing)
                    .set((
                        payments::status.eq(PaymentStatus::Pending.as_str()),
                        payments::raw_payload.eq(Some(raw.clone())),
                    ))
                    .execute(conn)?,
                AttemptOutcome::Rejected { reason } => diesel::update(processing)
                    .set((
                        payments::status.eq(PaymentStatus::Failed.as_str()),
                        payments::failure_reason.eq(Some(reason.as_str())),
                    ))
                    .execute(conn)?,
            };

            let row = payments::table
                .find(id)
                .select(PaymentRow::as_select())
                .first(conn)?;
            Payment::try_from(row)
        })
    }

    fn settle(&self, settlement: Settlement) -> Result<SettleResult, DomainError> {
        let mut conn = self.pool.get()?;

        conn.transaction::<_, DomainError, _>(|conn| {
            // Order row first, the same lock order as cancellation.
            let order_id: Option<Uuid> = payments::table
                .find(settlement.payment_id)
                .select(payments::order_id)
                .first(conn)
                .optional()?
                .ok_or(DomainError::NotFound)?;
            if let Some(order_id) = order_id {
                orders::table
                    .find(order_id)
                    .select(orders::id)
                    .for_update()
                    .first::<Uuid>(conn)
                    .optional()?;
            }

            let from: Vec<&str> = settlement
                .kind
                .settles_from()
                .iter()
                .map(PaymentStatus::as_str)
                .collect();
            let open = payments::table
                .filter(payments::id.eq(settlement.payment_id))
                .filter(payments::status.eq_any(from));
            let at = settlement.at;

            // Only one delivery can move the row out of an open status.
            let updated: Option<PaymentRow> = match &settlement.kind {
                SettlementKind::Completed { receipt } => diesel::update(open)
                    .set((
                        payments::status.eq(PaymentStatus::Completed.as_str()),
                        payments::receipt.eq(receipt.as_deref()),
                        payments::completed_at.eq(Some(at)),
                        payments::raw_payload.eq(Some(settlement.raw_payload.clone())),
                        payments::updated_at.eq(at),
                    ))
                    .returning(PaymentRow::as_returning())
                    .get_result(conn)
                    .optional()?,
                SettlementKind::Failed { reason } => diesel::update(open)
                    .set((
                        payments::status.eq(PaymentStatus::Failed.as_str()),
                        payments::failure_reason.eq(Some(reason.as_str())),
                        payments::raw_payload.eq(Some(settlement.raw_payload.clone())),
                        payments::updated_at.eq(at),
                    ))
                    .returning(PaymentRow::as_returning())
                    .get_result(conn)
                    .optional()?,
            };

            let Some(row) = updated else {
                let current = payments::table
                    .find(settlement.payment_id)
                    .select(PaymentRow::as_select())
                    .first(conn)
                    .optional()?
                    .ok_or(DomainError::NotFound)?;
                return Ok(SettleResult::AlreadyTerminal(Payment::try_from(current)?));
            };
            let payment = Payment::try_from(row)?;

            let Some(order_id) = payment.order_id else {
                return Ok(SettleResult::Applied(payment));
            };
            match &settlement.kind {
                SettlementKind::Completed { receipt } => {
                    mark_order_paid(conn, order_id, &payment, at)?;
                    record_event(
                        conn,
                        order_id,
                        "OrderPaid",
                        json!({
                            "order_id": order_id,
                            "payment_id": payment.id,
                            "provider": payment.provider.as_str(),
                            "receipt": receipt,
                            "amount": payment.amount.to_string(),
                        }),
                    )?;
                }
                SettlementKind::Failed { reason } => {
                    record_event(
                        conn,
                        order_id,
                        "PaymentFailed",
                        json!({
                            "order_id": order_id,
                            "payment_id": payment.id,
                            "provider": payment.provider.as_str(),
                            "reason": reason,
                        }),
                    )?;
                }
            }
            Ok(SettleResult::Applied(payment))
        })
    }
}

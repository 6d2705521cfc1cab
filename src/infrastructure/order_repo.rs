use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::db::DbPool;
use crate::domain::errors::DomainError;
use crate::domain::order::{
    page_offset, ListResult, NewOrder, Order, OrderPaymentStatus, OrderStatus, StatusChange,
};
use crate::domain::payment::{PaymentMethod, PaymentStatus};
use crate::domain::ports::{OrderRepository, ProductCatalog};
use crate::domain::product::{Product, StockLevel};
use crate::schema::{
    order_events_outbox, order_lines, order_status_history, orders, payments, products,
};

use super::models::{
    NewOrderLineRow, NewOrderRow, NewOutboxEventRow, NewStatusHistoryRow, OrderLineRow, OrderRow,
    ProductRow, StatusHistoryRow,
};
use super::payment_repo::OPEN_STATUSES;

// ── Error conversions (infrastructure concern only) ──────────────────────────

impl From<diesel::result::Error> for DomainError {
    fn from(e: diesel::result::Error) -> Self {
        match e {
            diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                DomainError::Conflict(info.message().to_string())
            }
            other => DomainError::Internal(other.to_string()),
        }
    }
}

impl From<r2d2::Error> for DomainError {
    fn from(e: r2d2::Error) -> Self {
        DomainError::Internal(e.to_string())
    }
}

// ── Shared transaction steps ──────────────────────────────────────────────────

pub(super) fn record_event(
    conn: &mut PgConnection,
    order_id: Uuid,
    event_type: &str,
    payload: Value,
) -> Result<(), DomainError> {
    diesel::insert_into(order_events_outbox::table)
        .values(&NewOutboxEventRow::order_event(order_id, event_type, payload))
        .execute(conn)?;
    Ok(())
}

pub(super) fn append_history(
    conn: &mut PgConnection,
    order_id: Uuid,
    status: OrderStatus,
    note: Option<String>,
    at: DateTime<Utc>,
) -> Result<(), DomainError> {
    diesel::insert_into(order_status_history::table)
        .values(&NewStatusHistoryRow {
            id: Uuid::new_v4(),
            order_id,
            status: status.to_string(),
            note,
            created_at: at,
        })
        .execute(conn)?;
    Ok(())
}

/// Attaches lines and history to a batch of order rows, keeping row order.
fn assemble(conn: &mut PgConnection, rows: Vec<OrderRow>) -> Result<Vec<Order>, DomainError> {
    let lines = OrderLineRow::belonging_to(&rows)
        .select(OrderLineRow::as_select())
        .order(order_lines::created_at.asc())
        .load(conn)?
        .grouped_by(&rows);
    let history = StatusHistoryRow::belonging_to(&rows)
        .select(StatusHistoryRow::as_select())
        .order(order_status_history::created_at.asc())
        .load(conn)?
        .grouped_by(&rows);
    rows.into_iter()
        .zip(lines)
        .zip(history)
        .map(|((row, lines), history)| row.into_order(lines, history))
        .collect()
}

fn load_order(conn: &mut PgConnection, id: Uuid) -> Result<Option<Order>, DomainError> {
    let row = orders::table
        .find(id)
        .select(OrderRow::as_select())
        .first(conn)
        .optional()?;
    match row {
        Some(row) => Ok(assemble(conn, vec![row])?.pop()),
        None => Ok(None),
    }
}

/// Explains why a conditional stock decrement matched no row.
fn reservation_error(conn: &mut PgConnection, product_id: Uuid, requested: i32) -> DomainError {
    let product = products::table
        .find(product_id)
        .select(ProductRow::as_select())
        .first(conn)
        .optional();
    match product {
        Ok(None) => DomainError::ProductNotFound(product_id),
        Ok(Some(p)) if !p.is_active => DomainError::ProductInactive(p.name),
        Ok(Some(p)) => DomainError::OutOfStock {
            product: p.name,
            requested,
            available: p.stock,
        },
        Err(e) => e.into(),
    }
}

// ── Repository ────────────────────────────────────────────────────────────────

pub struct DieselOrderRepository {
    pool: DbPool,
}

impl DieselOrderRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl ProductCatalog for DieselOrderRepository {
    fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Product>, DomainError> {
        let mut conn = self.pool.get()?;
        let rows = products::table
            .filter(products::id.eq_any(ids))
            .select(ProductRow::as_select())
            .load(&mut conn)?;
        Ok(rows.into_iter().map(Product::from).collect())
    }
}

impl OrderRepository for DieselOrderRepository {
    fn create(&self, order: NewOrder) -> Result<(Order, Vec<StockLevel>), DomainError> {
        let mut conn = self.pool.get()?;

        conn.transaction::<_, DomainError, _>(|conn| {
            let now = Utc::now();

            // 1. Reserve stock. Rows are touched in id order so concurrent
            //    checkouts over the same products cannot deadlock.
            let mut reservation: Vec<_> = order.lines.iter().collect();
            reservation.sort_by_key(|l| l.product_id);
            let mut levels = Vec::with_capacity(reservation.len());
            for line in reservation {
                let level: Option<(i32, i32)> = diesel::update(
                    products::table
                        .filter(products::id.eq(line.product_id))
                        .filter(products::is_active.eq(true))
                        .filter(products::stock.ge(line.quantity)),
                )
                .set((
                    products::stock.eq(products::stock - line.quantity),
                    products::updated_at.eq(now),
                ))
                .returning((products::stock, products::low_stock_alert))
                .get_result(conn)
                .optional()?;
                let Some((stock, low_stock_alert)) = level else {
                    return Err(reservation_error(conn, line.product_id, line.quantity));
                };
                levels.push(StockLevel {
                    product_id: line.product_id,
                    stock,
                    low_stock_alert,
                });
            }

            // 2. Insert the order
            let shipping_address = serde_json::to_value(&order.shipping_address)
                .map_err(|e| DomainError::Internal(e.to_string()))?;
            diesel::insert_into(orders::table)
                .values(&NewOrderRow {
                    id: order.id,
                    order_number: order.order_number.clone(),
                    customer_id: order.customer_id,
                    status: order.status.to_string(),
                    payment_status: OrderPaymentStatus::Pending.to_string(),
                    payment_method: order.payment_method.to_string(),
                    shipping_address,
                    subtotal: order.totals.subtotal.clone(),
                    shipping_cost: order.totals.shipping_cost.clone(),
                    tax: order.totals.tax.clone(),
                    total: order.totals.total.clone(),
                    currency: order.currency.clone(),
                })
                .execute(conn)?;

            // 3. Insert order lines with their catalog snapshot
            let new_lines: Vec<NewOrderLineRow> = order
                .lines
                .iter()
                .map(|l| NewOrderLineRow {
                    id: Uuid::new_v4(),
                    order_id: order.id,
                    product_id: l.product_id,
                    product_name: l.product_name.clone(),
                    unit_price: l.unit_price.clone(),
                    quantity: l.quantity,
                    line_total: l.line_total.clone(),
                })
                .collect();
            diesel::insert_into(order_lines::table)
                .values(&new_lines)
                .execute(conn)?;

            append_history(conn, order.id, order.status, Some("order placed".to_string()), now)?;

            // 4. Outbox event in the same transaction.
            let line_payloads: Vec<Value> = order
                .lines
                .iter()
                .map(|l| {
                    json!({
                        "product_id": l.product_id,
                        "quantity": l.quantity,
                        "unit_price": l.unit_price.to_string()
                    })
                })
                .collect();
            record_event(
                conn,
                order.id,
                "OrderCreated",
                json!({
                    "order_id": order.id,
                    "order_number": order.order_number,
                    "customer_id": order.customer_id,
                    "status": order.status.as_str(),
                    "payment_method": order.payment_method.as_str(),
                    "total": order.totals.total.to_string(),
                    "currency": order.currency,
                    "lines": line_payloads
                }),
            )?;

            let created = load_order(conn, order.id)?
                .ok_or_else(|| DomainError::Internal("order vanished after insert".to_string()))?;
            Ok((created, levels))
        })
    }

    fn find_by_id(&self, id: Uuid) -> Result<Option<Order>, DomainError> {
        let mut conn = self.pool.get()?;
        load_order(&mut conn, id)
    }

    fn list(&self, customer_id: Option<Uuid>, page: i64, limit: i64) -> Result<ListResult, DomainError> {
        let offset = page_offset(page, limit)?;
        let mut conn = self.pool.get()?;

        conn.transaction::<_, DomainError, _>(|conn| {
            let mut count = orders::table.into_boxed();
            let mut query = orders::table.into_boxed();
            if let Some(customer_id) = customer_id {
                count = count.filter(orders::customer_id.eq(customer_id));
                query = query.filter(orders::customer_id.eq(customer_id));
            }
            let total: i64 = count.count().get_result(conn)?;

            let rows = query
                .select(OrderRow::as_select())
                .order(orders::created_at.desc())
                .limit(limit)
                .offset(offset)
                .load(conn)?;

            Ok(ListResult {
                items: assemble(conn, rows)?,
                total,
            })
        })
    }

    fn change_status(&self, id: Uuid, change: StatusChange) -> Result<Order, DomainError> {
        let mut conn = self.pool.get()?;

        conn.transaction::<_, DomainError, _>(|conn| {
            let row = orders::table
                .find(id)
                .select(OrderRow::as_select())
                .for_update()
                .first(conn)
                .optional()?
                .ok_or(DomainError::NotFound)?;
            if row.status != change.from.as_str() {
                return Err(DomainError::Conflict(format!(
                    "order {} is {}, not {}",
                    row.order_number, row.status, change.from
                )));
            }
            if change.only_if_unpaid && row.payment_status == OrderPaymentStatus::Paid.as_str() {
                return Err(DomainError::Conflict(format!(
                    "order {} has already been paid",
                    row.order_number
                )));
            }

            let now = Utc::now();
            diesel::update(orders::table.find(id))
                .set((
                    orders::status.eq(change.to.as_str()),
                    orders::updated_at.eq(now),
                ))
                .execute(conn)?;
            if let Some(tracking) = &change.tracking_number {
                diesel::update(orders::table.find(id))
                    .set(orders::tracking_number.eq(Some(tracking.as_str())))
                    .execute(conn)?;
            }
            append_history(conn, id, change.to, change.note.clone(), now)?;

            let mut payments_cancelled = 0;
            if change.to == OrderStatus::Cancelled {
                payments_cancelled = diesel::update(
                    payments::table
                        .filter(payments::order_id.eq(Some(id)))
                        .filter(payments::status.eq_any(OPEN_STATUSES)),
                )
                .set((
                    payments::status.eq(PaymentStatus::Cancelled.as_str()),
                    payments::updated_at.eq(now),
                ))
                .execute(conn)?;
            }

            if change.release_stock {
                let lines = order_lines::table
                    .filter(order_lines::order_id.eq(id))
                    .select(OrderLineRow::as_select())
                    .order(order_lines::product_id.asc())
                    .load(conn)?;
                for line in lines {
                    diesel::update(products::table.find(line.product_id))
                        .set((
                            products::stock.eq(products::stock + line.quantity),
                            products::updated_at.eq(now),
                        ))
                        .execute(conn)?;
                }
            }

            let event_type = if change.to == OrderStatus::Cancelled {
                "OrderCancelled"
            } else {
                "OrderStatusChanged"
            };
            record_event(
                conn,
                id,
                event_type,
                json!({
                    "order_id": id,
                    "from": change.from.as_str(),
                    "to": change.to.as_str(),
                    "note": change.note,
                    "stock_released": change.release_stock,
                    "payments_cancelled": payments_cancelled,
                }),
            )?;

            load_order(conn, id)?.ok_or(DomainError::NotFound)
        })
    }

    fn set_payment_reference(&self, id: Uuid, reference: &str) -> Result<(), DomainError> {
        let mut conn = self.pool.get()?;
        let updated = diesel::update(orders::table.find(id))
            .set((
                orders::payment_reference.eq(Some(reference)),
                orders::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
        if updated == 0 {
            return Err(DomainError::NotFound);
        }
        Ok(())
    }

    fn find_unpaid_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, DomainError> {
        let mut conn = self.pool.get()?;
        let rows = orders::table
            .filter(orders::payment_method.ne(PaymentMethod::CashOnDelivery.as_str()))
            .filter(orders::payment_status.eq(OrderPaymentStatus::Pending.as_str()))
            .filter(orders::status.eq(OrderStatus::Pending.as_str()))
            .filter(orders::created_at.lt(cutoff))
            .select(OrderRow::as_select())
            .order(orders::created_at.asc())
            .load(&mut conn)?;
        assemble(&mut conn, rows)
    }
}

#[cfg(test)]
mod tests {
    use bigdecimal::BigDecimal;
    use chrono::Duration;
    use diesel::prelude::*;
    use uuid::Uuid;

    use super::DieselOrderRepository;
    use crate::domain::errors::DomainError;
    use crate::domain::order::{NewOrder, OrderStatus, PricedLine, ShippingAddress, StatusChange};
    use crate::domain::payment::PaymentMethod;
    use crate::domain::ports::{OrderRepository, ProductCatalog};
    use crate::domain::pricing::PricingPolicy;
    use crate::infrastructure::models::OutboxEventRow;
    use crate::infrastructure::test_db::{insert_product, setup_db, stock_levels};
    use crate::schema::order_events_outbox;

    fn new_order(lines: Vec<PricedLine>, method: PaymentMethod) -> NewOrder {
        let totals = PricingPolicy::default().quote(&lines);
        NewOrder {
            id: Uuid::new_v4(),
            order_number: crate::domain::order::generate_order_number(chrono::Utc::now()),
            customer_id: Uuid::new_v4(),
            status: if method.is_pay_now() {
                OrderStatus::Pending
            } else {
                OrderStatus::Confirmed
            },
            payment_method: method,
            lines,
            shipping_address: ShippingAddress {
                full_name: "Otieno J".to_string(),
                phone: "0722000111".to_string(),
                line1: "Ngong Rd 40".to_string(),
                line2: None,
                city: "Nairobi".to_string(),
                region: None,
                postal_code: Some("00100".to_string()),
                country: "KE".to_string(),
            },
            totals,
            currency: "KES".to_string(),
        }
    }

    fn line(product_id: Uuid, name: &str, price: i32, quantity: i32) -> PricedLine {
        PricedLine {
            product_id,
            product_name: name.to_string(),
            unit_price: BigDecimal::from(price),
            quantity,
            line_total: BigDecimal::from(price * quantity),
        }
    }

    #[tokio::test]
    async fn create_reserves_stock_and_snapshots_lines() {
        let (_container, pool) = setup_db().await;
        let beans = insert_product(&pool, "Kenya AA", 850, 3);
        let repo = DieselOrderRepository::new(pool.clone());

        let (order, levels) = repo
            .create(new_order(vec![line(beans, "Kenya AA", 850, 3)], PaymentMethod::Mpesa))
            .expect("create failed");

        assert_eq!(order.total, BigDecimal::from(2900));
        assert_eq!(order.lines[0].product_name, "Kenya AA");
        assert_eq!(order.history.len(), 1);
        assert_eq!(levels[0].stock, 0);
        assert_eq!(stock_levels(&pool, &[beans]).unwrap()[&beans], 0);
        let found = repo.find_by_ids(&[beans]).expect("catalog lookup failed");
        assert_eq!(found[0].stock, 0);
    }

    #[tokio::test]
    async fn failed_reservation_rolls_back_every_line() {
        let (_container, pool) = setup_db().await;
        let beans = insert_product(&pool, "Kenya AA", 850, 3);
        let filters = insert_product(&pool, "Paper filters", 200, 50);
        let repo = DieselOrderRepository::new(pool.clone());

        let err = repo
            .create(new_order(
                vec![
                    line(filters, "Paper filters", 200, 5),
                    line(beans, "Kenya AA", 850, 4),
                ],
                PaymentMethod::Mpesa,
            ))
            .unwrap_err();

        assert!(matches!(
            err,
            DomainError::OutOfStock { requested: 4, available: 3, .. }
        ));
        let levels = stock_levels(&pool, &[beans, filters]).unwrap();
        assert_eq!(levels[&beans], 3);
        assert_eq!(levels[&filters], 50);
        let mut conn = pool.get().expect("Failed to get connection");
        let events: i64 = order_events_outbox::table
            .count()
            .get_result(&mut conn)
            .expect("count failed");
        assert_eq!(events, 0);
    }

    #[tokio::test]
    async fn concurrent_checkouts_never_oversell() {
        let (_container, pool) = setup_db().await;
        let beans = insert_product(&pool, "Kenya AA", 850, 1);
        let repo = std::sync::Arc::new(DieselOrderRepository::new(pool.clone()));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let repo = repo.clone();
                std::thread::spawn(move || {
                    repo.create(new_order(
                        vec![line(beans, "Kenya AA", 850, 1)],
                        PaymentMethod::Mpesa,
                    ))
                })
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(stock_levels(&pool, &[beans]).unwrap()[&beans], 0);
    }

    #[tokio::test]
    async fn duplicate_order_number_is_a_conflict() {
        let (_container, pool) = setup_db().await;
        let beans = insert_product(&pool, "Kenya AA", 850, 10);
        let repo = DieselOrderRepository::new(pool.clone());
        let first = new_order(vec![line(beans, "Kenya AA", 850, 1)], PaymentMethod::Mpesa);
        let mut second = new_order(vec![line(beans, "Kenya AA", 850, 1)], PaymentMethod::Mpesa);
        second.order_number = first.order_number.clone();

        repo.create(first).expect("create failed");
        let err = repo.create(second).unwrap_err();

        assert!(matches!(err, DomainError::Conflict(_)));
        assert_eq!(stock_levels(&pool, &[beans]).unwrap()[&beans], 9);
    }

    #[tokio::test]
    async fn cancelling_releases_stock_and_writes_outbox() {
        let (_container, pool) = setup_db().await;
        let beans = insert_product(&pool, "Kenya AA", 850, 5);
        let repo = DieselOrderRepository::new(pool.clone());
        let (order, _) = repo
            .create(new_order(vec![line(beans, "Kenya AA", 850, 2)], PaymentMethod::Mpesa))
            .expect("create failed");

        let cancel = StatusChange {
            from: OrderStatus::Pending,
            to: OrderStatus::Cancelled,
            note: Some("changed my mind".to_string()),
            tracking_number: None,
            release_stock: true,
            only_if_unpaid: true,
        };
        let cancelled = repo.change_status(order.id, cancel.clone()).expect("cancel failed");
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.history.len(), 2);
        assert_eq!(stock_levels(&pool, &[beans]).unwrap()[&beans], 5);

        let again = repo.change_status(order.id, cancel);
        assert!(matches!(again, Err(DomainError::Conflict(_))));
        assert_eq!(stock_levels(&pool, &[beans]).unwrap()[&beans], 5);

        let mut conn = pool.get().expect("Failed to get connection");
        let events: Vec<OutboxEventRow> = order_events_outbox::table
            .filter(order_events_outbox::aggregate_id.eq(order.id.to_string()))
            .select(OutboxEventRow::as_select())
            .order(order_events_outbox::created_at.asc())
            .load(&mut conn)
            .expect("query failed");
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["OrderCreated", "OrderCancelled"]);
    }

    #[tokio::test]
    async fn list_filters_by_customer_and_paginates() {
        let (_container, pool) = setup_db().await;
        let beans = insert_product(&pool, "Kenya AA", 850, 100);
        let repo = DieselOrderRepository::new(pool);
        let customer_id = Uuid::new_v4();

        for _ in 0..5 {
            let mut order = new_order(vec![line(beans, "Kenya AA", 850, 1)], PaymentMethod::Mpesa);
            order.customer_id = customer_id;
            repo.create(order).expect("create failed");
        }
        repo.create(new_order(vec![line(beans, "Kenya AA", 850, 1)], PaymentMethod::Mpesa))
            .expect("create failed");

        let page1 = repo.list(Some(customer_id), 1, 3).expect("list page 1 failed");
        assert_eq!(page1.total, 5);
        assert_eq!(page1.items.len(), 3);
        assert_eq!(page1.items[0].lines.len(), 1);

        let page2 = repo.list(Some(customer_id), 2, 3).expect("list page 2 failed");
        assert_eq!(page2.items.len(), 2);

        assert_eq!(repo.list(None, 1, 20).expect("list all failed").total, 6);
    }

    #[tokio::test]
    async fn unpaid_lookup_skips_cash_on_delivery() {
        let (_container, pool) = setup_db().await;
        let beans = insert_product(&pool, "Kenya AA", 850, 10);
        let repo = DieselOrderRepository::new(pool);
        let (mpesa, _) = repo
            .create(new_order(vec![line(beans, "Kenya AA", 850, 1)], PaymentMethod::Mpesa))
            .expect("create failed");
        repo.create(new_order(
            vec![line(beans, "Kenya AA", 850, 1)],
            PaymentMethod::CashOnDelivery,
        ))
        .expect("create failed");

        let stale = repo
            .find_unpaid_before(chrono::Utc::now() + Duration::minutes(1))
            .expect("lookup failed");

        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, mpesa.id);
        assert!(repo
            .find_unpaid_before(chrono::Utc::now() - Duration::hours(1))
            .expect("lookup failed")
            .is_empty());
    }

    #[tokio::test]
    async fn find_by_id_returns_none_for_unknown_id() {
        let (_container, pool) = setup_db().await;
        let repo = DieselOrderRepository::new(pool);

        let result = repo
            .find_by_id(Uuid::new_v4())
            .expect("find should not error");

        assert!(result.is_none());
    }
}

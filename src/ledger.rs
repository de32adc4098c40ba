//! Payment ledger.
//!
//! Status moves `pending -> completed | cancelled | failed` and
//! `completed -> refunded`. Every transition is one conditional UPDATE
//! matching the expected current status, and the student balance changes in
//! the same transaction as the transition that causes it.

use crate::audit::{self, AuditEvent, Category, Outcome, Severity};
use crate::authz::{self, Action, Actor, Role};
use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::model::{
    self, Channels, NotificationType, Page, PaymentMethod, PaymentStatus, PaymentType, Priority,
};
use crate::notify::{self, NotificationDispatch, OutboundNotification};
use crate::profiles::{self, StudentRef};
use crate::settings;
use crate::validate::{self, round_cents};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;

const INVOICE_SEQUENCE: &str = "invoice";

pub fn format_invoice_number(n: i64) -> String {
    format!("INV-{:06}", n)
}

/// Amount due after adjustments, never below zero. The stored `amount`
/// itself is never changed by discounts or fees.
pub fn final_amount(amount: f64, discount: f64, late_fee: f64) -> f64 {
    round_cents((amount - discount + late_fee).max(0.0))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Discount {
    pub amount: f64,
    pub percentage: Option<f64>,
    pub reason: Option<String>,
    pub approved_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LateFee {
    pub amount: f64,
    pub reason: Option<String>,
    pub approved_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Refund {
    pub amount: f64,
    pub reason: Option<String>,
    pub approved_by: Option<String>,
    pub refunded_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub student_id: String,
    pub invoice_number: String,
    pub amount: f64,
    pub currency: String,
    pub payment_type: PaymentType,
    pub method: Option<PaymentMethod>,
    pub status: PaymentStatus,
    pub due_date: String,
    pub description: Option<String>,
    pub transaction_id: Option<String>,
    pub paid_date: Option<String>,
    pub processed_by: Option<String>,
    pub discount: Option<Discount>,
    pub late_fee: Option<LateFee>,
    pub refund: Option<Refund>,
    pub closed_reason: Option<String>,
    pub closed_by: Option<String>,
    pub closed_at: Option<String>,
    pub final_amount: f64,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

const PAYMENT_COLUMNS: &str = "id, student_id, invoice_number, amount, currency, payment_type,
    method, status, due_date, description, transaction_id, paid_date, processed_by,
    discount_amount, discount_percentage, discount_reason, discount_approved_by,
    late_fee_amount, late_fee_reason, late_fee_approved_by,
    refund_amount, refund_reason, refund_approved_by, refunded_at,
    closed_reason, closed_by, closed_at, created_by, created_at, updated_at";

fn row_to_payment(r: &rusqlite::Row<'_>) -> rusqlite::Result<Payment> {
    let amount: f64 = r.get(3)?;
    let discount_amount: f64 = r.get(13)?;
    let late_fee_amount: f64 = r.get(17)?;
    let discount_by: Option<String> = r.get(16)?;
    let late_fee_by: Option<String> = r.get(19)?;
    let refund_amount: Option<f64> = r.get(20)?;
    Ok(Payment {
        id: r.get(0)?,
        student_id: r.get(1)?,
        invoice_number: r.get(2)?,
        amount,
        currency: r.get(4)?,
        payment_type: r.get(5)?,
        method: r.get(6)?,
        status: r.get(7)?,
        due_date: r.get(8)?,
        description: r.get(9)?,
        transaction_id: r.get(10)?,
        paid_date: r.get(11)?,
        processed_by: r.get(12)?,
        discount: match discount_by {
            Some(by) => Some(Discount {
                amount: discount_amount,
                percentage: r.get(14)?,
                reason: r.get(15)?,
                approved_by: Some(by),
            }),
            None => None,
        },
        late_fee: match late_fee_by {
            Some(by) => Some(LateFee {
                amount: late_fee_amount,
                reason: r.get(18)?,
                approved_by: Some(by),
            }),
            None => None,
        },
        refund: match refund_amount {
            Some(v) => Some(Refund {
                amount: v,
                reason: r.get(21)?,
                approved_by: r.get(22)?,
                refunded_at: r.get(23)?,
            }),
            None => None,
        },
        closed_reason: r.get(24)?,
        closed_by: r.get(25)?,
        closed_at: r.get(26)?,
        final_amount: final_amount(amount, discount_amount, late_fee_amount),
        created_by: r.get(27)?,
        created_at: r.get(28)?,
        updated_at: r.get(29)?,
    })
}

pub fn load_payment(conn: &Connection, payment_id: &str) -> CoreResult<Payment> {
    conn.query_row(
        &format!("SELECT {} FROM payments WHERE id = ?", PAYMENT_COLUMNS),
        [payment_id],
        row_to_payment,
    )
    .optional()?
    .ok_or(CoreError::NotFound("payment"))
}

fn student_balance(conn: &Connection, student_id: &str) -> CoreResult<f64> {
    conn.query_row("SELECT balance FROM students WHERE id = ?", [student_id], |r| r.get(0))
        .optional()?
        .ok_or(CoreError::NotFound("student"))
}

/// Explain why a conditional transition matched nothing.
fn transition_refused(conn: &Connection, payment_id: &str, attempted: PaymentStatus) -> CoreError {
    match load_payment(conn, payment_id) {
        Ok(p) if p.status.can_transition_to(attempted) => CoreError::conflict(format!(
            "payment {} changed concurrently, retry",
            p.invoice_number
        )),
        Ok(p) => CoreError::invalid_state(format!(
            "payment {} is {}, cannot become {}",
            p.invoice_number, p.status, attempted
        )),
        Err(e) => e,
    }
}

fn payment_messages(
    student: &StudentRef,
    sender: &Actor,
    title: &str,
    message: String,
) -> Vec<OutboundNotification> {
    let mut out = vec![OutboundNotification {
        recipient_type: Role::Student,
        recipient_id: student.account_id.clone(),
        sender_id: Some(sender.id.clone()),
        title: title.to_string(),
        message: message.clone(),
        notification_type: NotificationType::Payment,
        priority: Priority::Normal,
        channels: Channels::default(),
    }];
    if let Some(guardian) = &student.guardian_account_id {
        out.push(OutboundNotification {
            recipient_type: Role::Guardian,
            recipient_id: guardian.clone(),
            sender_id: Some(sender.id.clone()),
            title: title.to_string(),
            message,
            notification_type: NotificationType::Payment,
            priority: Priority::Normal,
            channels: student.guardian_preferences,
        });
    }
    out
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NewInvoice {
    pub student_id: String,
    pub amount: f64,
    pub payment_type: PaymentType,
    pub due_date: String,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

pub fn create_invoice(
    conn: &Connection,
    dispatcher: &dyn NotificationDispatch,
    actor: &Actor,
    input: &NewInvoice,
) -> CoreResult<Payment> {
    authz::require_admin(actor)?;
    let student = profiles::student_ref(conn, &input.student_id)?;
    let amount = validate::money(input.amount, "amount")?;
    if amount <= 0.0 {
        return Err(CoreError::validation("amount must be greater than zero"));
    }
    let due_date = validate::date(&input.due_date, "dueDate")?.format("%Y-%m-%d").to_string();
    let currency = match input.currency.as_deref().map(str::trim) {
        Some(c) if !c.is_empty() => {
            if c.len() != 3 || !c.chars().all(|ch| ch.is_ascii_alphabetic()) {
                return Err(CoreError::validation("currency must be a 3-letter code"));
            }
            c.to_ascii_uppercase()
        }
        _ => settings::default_currency(conn),
    };
    let description = validate::optional_text(input.description.as_deref(), "description", 500)?;

    let id = model::new_id();
    let now = model::now();
    let tx = conn.unchecked_transaction()?;
    let invoice_number = format_invoice_number(db::next_sequence(&tx, INVOICE_SEQUENCE)?);
    tx.execute(
        "INSERT INTO payments(id, student_id, invoice_number, amount, currency, payment_type,
                              status, due_date, description, created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?)",
        params![
            id,
            student.id,
            invoice_number,
            amount,
            currency,
            input.payment_type,
            due_date,
            description,
            actor.id,
            now,
            now
        ],
    )?;
    tx.commit()?;

    notify::dispatch_all(
        dispatcher,
        &payment_messages(
            &student,
            actor,
            "New invoice",
            format!(
                "Invoice {} for {} {:.2} is due on {}.",
                invoice_number, currency, amount, due_date
            ),
        ),
    );
    audit::record(
        conn,
        AuditEvent::new("payment.create_invoice", "payment", Category::Financial)
            .entity(&id)
            .by(actor)
            .describe(format!("issued {} to {}", invoice_number, student.name))
            .details(json!({ "amount": amount, "currency": currency, "studentId": student.id }))
            .outcome(Outcome::Success, Severity::Medium),
    );
    load_payment(conn, &id)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PayInput {
    pub payment_id: String,
    pub method: PaymentMethod,
    #[serde(default)]
    pub transaction_id: Option<String>,
}

/// Settle a pending payment. The owning student's balance drops by the
/// invoice amount, floored at zero.
pub fn pay(
    conn: &Connection,
    dispatcher: &dyn NotificationDispatch,
    actor: &Actor,
    input: &PayInput,
) -> CoreResult<Payment> {
    let payment = load_payment(conn, &input.payment_id)?;
    let student = profiles::student_ref(conn, &payment.student_id)?;
    profiles::require_access(conn, actor, Action::Pay, &student.account_id)?;
    let transaction_id = validate::optional_text(input.transaction_id.as_deref(), "transactionId", 120)?;

    let balance_before = student_balance(conn, &student.id)?;
    let now = model::now();
    let tx = conn.unchecked_transaction()?;
    let changed = tx.execute(
        "UPDATE payments SET status = 'completed', method = ?, transaction_id = ?,
             paid_date = ?, processed_by = ?, updated_at = ?
         WHERE id = ? AND status = 'pending'",
        params![input.method, transaction_id, now, actor.id, now, payment.id],
    )?;
    if changed == 0 {
        drop(tx);
        return Err(transition_refused(conn, &payment.id, PaymentStatus::Completed));
    }
    tx.execute(
        "UPDATE students SET balance = MAX(0, balance - ?), updated_at = ? WHERE id = ?",
        params![payment.amount, now, student.id],
    )?;
    tx.commit()?;
    let balance_after = student_balance(conn, &student.id)?;

    notify::dispatch_all(
        dispatcher,
        &payment_messages(
            &student,
            actor,
            "Payment received",
            format!(
                "Payment of {} {:.2} for {} was received.",
                payment.currency, payment.amount, payment.invoice_number
            ),
        ),
    );
    audit::record(
        conn,
        AuditEvent::new("payment.pay", "payment", Category::Financial)
            .entity(&payment.id)
            .by(actor)
            .describe(format!("{} paid by {}", payment.invoice_number, input.method))
            .details(json!({
                "amount": payment.amount,
                "balanceBefore": balance_before,
                "balanceAfter": balance_after,
            }))
            .outcome(Outcome::Success, Severity::Medium),
    );
    load_payment(conn, &payment.id)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DiscountInput {
    pub payment_id: String,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Set the discount on a pending payment, replacing any earlier one. Given
/// either as an absolute amount or as a percentage of the invoice amount.
pub fn apply_discount(conn: &Connection, actor: &Actor, input: &DiscountInput) -> CoreResult<Payment> {
    authz::require_admin(actor)?;
    let payment = load_payment(conn, &input.payment_id)?;
    let (discount, percentage) = match (input.amount, input.percentage) {
        (Some(a), None) => {
            let a = validate::money(a, "amount")?;
            if a > payment.amount {
                return Err(CoreError::validation("discount cannot exceed the invoice amount"));
            }
            (a, None)
        }
        (None, Some(p)) => {
            let max = settings::max_discount_percent(conn) as f64;
            if !p.is_finite() || p <= 0.0 || p > max {
                return Err(CoreError::validation(format!(
                    "percentage must be in (0, {}]",
                    max
                )));
            }
            (round_cents(payment.amount * p / 100.0), Some(p))
        }
        _ => {
            return Err(CoreError::validation(
                "give exactly one of amount or percentage",
            ))
        }
    };
    let reason = validate::optional_text(input.reason.as_deref(), "reason", 500)?;

    let changed = conn.execute(
        "UPDATE payments SET discount_amount = ?, discount_percentage = ?, discount_reason = ?,
             discount_approved_by = ?, updated_at = ?
         WHERE id = ? AND status = 'pending'",
        params![discount, percentage, reason, actor.id, model::now(), payment.id],
    )?;
    if changed == 0 {
        return Err(CoreError::invalid_state(format!(
            "discounts apply to pending payments, {} is {}",
            payment.invoice_number, payment.status
        )));
    }
    audit::record(
        conn,
        AuditEvent::new("payment.apply_discount", "payment", Category::Financial)
            .entity(&payment.id)
            .by(actor)
            .describe(format!("discount on {}", payment.invoice_number))
            .details(json!({
                "before": payment.discount.as_ref().map(|d| d.amount),
                "after": discount,
                "percentage": percentage,
            }))
            .outcome(Outcome::Success, Severity::Medium),
    );
    load_payment(conn, &payment.id)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LateFeeInput {
    pub payment_id: String,
    pub amount: f64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Late fees accumulate on a pending payment.
pub fn add_late_fee(conn: &Connection, actor: &Actor, input: &LateFeeInput) -> CoreResult<Payment> {
    authz::require_admin(actor)?;
    let payment = load_payment(conn, &input.payment_id)?;
    let fee = validate::money(input.amount, "amount")?;
    if fee <= 0.0 {
        return Err(CoreError::validation("late fee must be greater than zero"));
    }
    let reason = validate::optional_text(input.reason.as_deref(), "reason", 500)?;
    let changed = conn.execute(
        "UPDATE payments SET late_fee_amount = ROUND(late_fee_amount + ?, 2), late_fee_reason = ?,
             late_fee_approved_by = ?, updated_at = ?
         WHERE id = ? AND status = 'pending'",
        params![fee, reason, actor.id, model::now(), payment.id],
    )?;
    if changed == 0 {
        return Err(CoreError::invalid_state(format!(
            "late fees apply to pending payments, {} is {}",
            payment.invoice_number, payment.status
        )));
    }
    audit::record(
        conn,
        AuditEvent::new("payment.add_late_fee", "payment", Category::Financial)
            .entity(&payment.id)
            .by(actor)
            .describe(format!("late fee on {}", payment.invoice_number))
            .details(json!({ "fee": fee }))
            .outcome(Outcome::Success, Severity::Medium),
    );
    load_payment(conn, &payment.id)
}

/// Close a pending payment as cancelled or failed.
fn close_pending(
    conn: &Connection,
    actor: &Actor,
    payment_id: &str,
    to: PaymentStatus,
    reason: Option<&str>,
) -> CoreResult<Payment> {
    authz::require_admin(actor)?;
    let payment = load_payment(conn, payment_id)?;
    let reason = validate::optional_text(reason, "reason", 500)?;
    let now = model::now();
    let changed = conn.execute(
        "UPDATE payments SET status = ?, closed_reason = ?, closed_by = ?, closed_at = ?, updated_at = ?
         WHERE id = ? AND status = 'pending'",
        params![to, reason, actor.id, now, now, payment.id],
    )?;
    if changed == 0 {
        return Err(transition_refused(conn, &payment.id, to));
    }
    let action = match to {
        PaymentStatus::Cancelled => "payment.cancel",
        _ => "payment.fail",
    };
    audit::record(
        conn,
        AuditEvent::new(action, "payment", Category::Financial)
            .entity(&payment.id)
            .by(actor)
            .describe(format!("{} marked {}", payment.invoice_number, to))
            .details(json!({ "reason": reason, "before": payment.status, "after": to }))
            .outcome(Outcome::Success, Severity::Medium),
    );
    load_payment(conn, &payment.id)
}

pub fn cancel(conn: &Connection, actor: &Actor, payment_id: &str, reason: Option<&str>) -> CoreResult<Payment> {
    close_pending(conn, actor, payment_id, PaymentStatus::Cancelled, reason)
}

pub fn fail(conn: &Connection, actor: &Actor, payment_id: &str, reason: Option<&str>) -> CoreResult<Payment> {
    close_pending(conn, actor, payment_id, PaymentStatus::Failed, reason)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RefundInput {
    pub payment_id: String,
    pub amount: f64,
    pub reason: String,
}

/// Refund a completed payment. The refunded amount is capped at the
/// original invoice amount and credited back to the student's balance.
pub fn refund(
    conn: &Connection,
    dispatcher: &dyn NotificationDispatch,
    actor: &Actor,
    input: &RefundInput,
) -> CoreResult<Payment> {
    authz::require_admin(actor)?;
    let payment = load_payment(conn, &input.payment_id)?;
    let requested = validate::money(input.amount, "amount")?;
    if requested <= 0.0 {
        return Err(CoreError::validation("refund amount must be greater than zero"));
    }
    let reason = validate::required_text(&input.reason, "reason", 500)?;
    let refunded = requested.min(payment.amount);
    let student = profiles::student_ref(conn, &payment.student_id)?;
    let balance_before = student_balance(conn, &student.id)?;

    let now = model::now();
    let tx = conn.unchecked_transaction()?;
    let changed = tx.execute(
        "UPDATE payments SET status = 'refunded', refund_amount = ?, refund_reason = ?,
             refund_approved_by = ?, refunded_at = ?, updated_at = ?
         WHERE id = ? AND status = 'completed'",
        params![refunded, reason, actor.id, now, now, payment.id],
    )?;
    if changed == 0 {
        drop(tx);
        return Err(transition_refused(conn, &payment.id, PaymentStatus::Refunded));
    }
    tx.execute(
        "UPDATE students SET balance = ROUND(balance + ?, 2), updated_at = ? WHERE id = ?",
        params![refunded, now, student.id],
    )?;
    tx.commit()?;
    let balance_after = student_balance(conn, &student.id)?;

    notify::dispatch_all(
        dispatcher,
        &payment_messages(
            &student,
            actor,
            "Payment refunded",
            format!(
                "{} {:.2} of {} was refunded.",
                payment.currency, refunded, payment.invoice_number
            ),
        ),
    );
    audit::record(
        conn,
        AuditEvent::new("payment.refund", "payment", Category::Financial)
            .entity(&payment.id)
            .by(actor)
            .describe(format!("refunded {}", payment.invoice_number))
            .details(json!({
                "requested": requested,
                "refunded": refunded,
                "balanceBefore": balance_before,
                "balanceAfter": balance_after,
            }))
            .outcome(Outcome::Success, Severity::High),
    );
    load_payment(conn, &payment.id)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BalanceAdjustment {
    pub student_id: String,
    /// Signed change applied to the balance.
    pub delta: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceChange {
    pub student_id: String,
    pub before: f64,
    pub after: f64,
}

/// Administrative correction of a student's balance, floored at zero.
pub fn adjust_balance(conn: &Connection, actor: &Actor, input: &BalanceAdjustment) -> CoreResult<BalanceChange> {
    authz::require_admin(actor)?;
    if !input.delta.is_finite() || input.delta == 0.0 {
        return Err(CoreError::validation("delta must be a non-zero amount"));
    }
    let reason = validate::required_text(&input.reason, "reason", 500)?;
    let student = profiles::student_ref(conn, &input.student_id)?;

    let tx = conn.unchecked_transaction()?;
    let before = student_balance(&tx, &student.id)?;
    tx.execute(
        "UPDATE students SET balance = MAX(0, ROUND(balance + ?, 2)), updated_at = ? WHERE id = ?",
        params![round_cents(input.delta), model::now(), student.id],
    )?;
    let after = student_balance(&tx, &student.id)?;
    tx.commit()?;

    audit::record(
        conn,
        AuditEvent::new("payment.adjust_balance", "student", Category::Financial)
            .entity(&student.id)
            .by(actor)
            .describe(format!("balance of {} adjusted", student.name))
            .details(json!({ "before": before, "after": after, "delta": input.delta, "reason": reason }))
            .outcome(Outcome::Success, Severity::High),
    );
    Ok(BalanceChange {
        student_id: student.id,
        before,
        after,
    })
}

pub fn get(conn: &Connection, actor: &Actor, payment_id: &str) -> CoreResult<Payment> {
    let payment = load_payment(conn, payment_id)?;
    let student = profiles::student_ref(conn, &payment.student_id)?;
    profiles::require_access(conn, actor, Action::Read, &student.account_id)?;
    Ok(payment)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PaymentFilter {
    pub student_id: Option<String>,
    pub status: Option<PaymentStatus>,
    pub payment_type: Option<PaymentType>,
    pub due_from: Option<String>,
    pub due_to: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTotal {
    pub count: i64,
    pub total: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSummary {
    pub pending: StatusTotal,
    pub completed: StatusTotal,
    pub failed: StatusTotal,
    pub cancelled: StatusTotal,
    pub refunded: StatusTotal,
}

impl LedgerSummary {
    fn slot(&mut self, status: PaymentStatus) -> &mut StatusTotal {
        match status {
            PaymentStatus::Pending => &mut self.pending,
            PaymentStatus::Completed => &mut self.completed,
            PaymentStatus::Failed => &mut self.failed,
            PaymentStatus::Cancelled => &mut self.cancelled,
            PaymentStatus::Refunded => &mut self.refunded,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentList {
    pub payments: Vec<Payment>,
    pub summary: LedgerSummary,
}

/// Payments the actor may see, with per-status counts and final-amount
/// totals over every match.
pub fn list(conn: &Connection, actor: &Actor, filter: &PaymentFilter) -> CoreResult<PaymentList> {
    let mut where_sql = String::from(" WHERE 1 = 1");
    let mut args: Vec<SqlValue> = Vec::new();
    match (&filter.student_id, actor.role) {
        (Some(student_id), _) => {
            let student = profiles::student_ref(conn, student_id)?;
            profiles::require_access(conn, actor, Action::Read, &student.account_id)?;
            where_sql.push_str(" AND student_id = ?");
            args.push(SqlValue::Text(student.id));
        }
        (None, Role::Admin) => {}
        (None, Role::Student | Role::Guardian) => {
            where_sql.push_str(
                " AND student_id IN (SELECT s.id FROM students s
                   LEFT JOIN guardians g ON g.id = s.guardian_id
                   WHERE s.account_id = ? OR g.account_id = ?)",
            );
            args.push(SqlValue::Text(actor.id.clone()));
            args.push(SqlValue::Text(actor.id.clone()));
        }
        (None, Role::Teacher) => {
            return Err(CoreError::forbidden("payments are not visible to teachers"));
        }
    }
    if let Some(status) = filter.status {
        where_sql.push_str(" AND status = ?");
        args.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(kind) = filter.payment_type {
        where_sql.push_str(" AND payment_type = ?");
        args.push(SqlValue::Text(kind.as_str().to_string()));
    }
    if let Some(from) = &filter.due_from {
        let d = validate::date(from, "dueFrom")?;
        where_sql.push_str(" AND due_date >= ?");
        args.push(SqlValue::Text(d.format("%Y-%m-%d").to_string()));
    }
    if let Some(to) = &filter.due_to {
        let d = validate::date(to, "dueTo")?;
        where_sql.push_str(" AND due_date <= ?");
        args.push(SqlValue::Text(d.format("%Y-%m-%d").to_string()));
    }

    let mut summary = LedgerSummary::default();
    {
        let mut stmt = conn.prepare(&format!(
            "SELECT status, COUNT(*),
                    COALESCE(SUM(MAX(0, amount - discount_amount + late_fee_amount)), 0)
             FROM payments{} GROUP BY status",
            where_sql
        ))?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |r| {
            Ok((r.get::<_, PaymentStatus>(0)?, r.get::<_, i64>(1)?, r.get::<_, f64>(2)?))
        })?;
        for row in rows {
            let (status, count, total) = row?;
            let slot = summary.slot(status);
            slot.count = count;
            slot.total = round_cents(total);
        }
    }

    let page = Page::new(filter.limit, filter.offset);
    args.push(SqlValue::Integer(page.limit));
    args.push(SqlValue::Integer(page.offset));
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM payments{} ORDER BY created_at DESC, invoice_number DESC LIMIT ? OFFSET ?",
        PAYMENT_COLUMNS, where_sql
    ))?;
    let payments = stmt
        .query_map(params_from_iter(args.iter()), row_to_payment)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PaymentList { payments, summary })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoice_numbers_are_zero_padded() {
        assert_eq!(format_invoice_number(1), "INV-000001");
        assert_eq!(format_invoice_number(123456), "INV-123456");
    }

    #[test]
    fn final_amount_applies_adjustments_and_floors_at_zero() {
        assert_eq!(final_amount(300.0, 50.0, 20.0), 270.0);
        assert_eq!(final_amount(100.0, 150.0, 0.0), 0.0);
        assert_eq!(final_amount(99.99, 0.0, 0.01), 100.0);
    }

    #[test]
    fn invoice_sequence_is_monotonic() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute("CREATE TABLE sequences(name TEXT PRIMARY KEY, value INTEGER NOT NULL)", [])
            .expect("create");
        let a = db::next_sequence(&conn, INVOICE_SEQUENCE).expect("next");
        let b = db::next_sequence(&conn, INVOICE_SEQUENCE).expect("next");
        assert_eq!((a, b), (1, 2));
    }
}

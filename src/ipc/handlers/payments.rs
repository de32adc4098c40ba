use super::{params, to_json, with_actor, IdParams};
use crate::ipc::types::{AppState, Request};
use crate::ledger::{
    self, BalanceAdjustment, DiscountInput, LateFeeInput, NewInvoice, PayInput, PaymentFilter,
    RefundInput,
};
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CloseParams {
    payment_id: String,
    #[serde(default)]
    reason: Option<String>,
}

fn handle_create_invoice(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let input: NewInvoice = params(req)?;
        to_json(ledger::create_invoice(&ws.conn, ws.notifier.as_ref(), actor, &input)?)
    })
}

fn handle_pay(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let input: PayInput = params(req)?;
        to_json(ledger::pay(&ws.conn, ws.notifier.as_ref(), actor, &input)?)
    })
}

fn handle_apply_discount(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let input: DiscountInput = params(req)?;
        to_json(ledger::apply_discount(&ws.conn, actor, &input)?)
    })
}

fn handle_add_late_fee(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let input: LateFeeInput = params(req)?;
        to_json(ledger::add_late_fee(&ws.conn, actor, &input)?)
    })
}

fn handle_cancel(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: CloseParams = params(req)?;
        to_json(ledger::cancel(&ws.conn, actor, &p.payment_id, p.reason.as_deref())?)
    })
}

fn handle_fail(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: CloseParams = params(req)?;
        to_json(ledger::fail(&ws.conn, actor, &p.payment_id, p.reason.as_deref())?)
    })
}

fn handle_refund(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let input: RefundInput = params(req)?;
        to_json(ledger::refund(&ws.conn, ws.notifier.as_ref(), actor, &input)?)
    })
}

fn handle_adjust_balance(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let input: BalanceAdjustment = params(req)?;
        to_json(ledger::adjust_balance(&ws.conn, actor, &input)?)
    })
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: IdParams = params(req)?;
        to_json(ledger::get(&ws.conn, actor, &p.id)?)
    })
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let filter: PaymentFilter = params(req)?;
        to_json(ledger::list(&ws.conn, actor, &filter)?)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "payments.createInvoice" => Some(handle_create_invoice(state, req)),
        "payments.pay" => Some(handle_pay(state, req)),
        "payments.applyDiscount" => Some(handle_apply_discount(state, req)),
        "payments.addLateFee" => Some(handle_add_late_fee(state, req)),
        "payments.cancel" => Some(handle_cancel(state, req)),
        "payments.fail" => Some(handle_fail(state, req)),
        "payments.refund" => Some(handle_refund(state, req)),
        "payments.adjustBalance" => Some(handle_adjust_balance(state, req)),
        "payments.get" => Some(handle_get(state, req)),
        "payments.list" => Some(handle_list(state, req)),
        _ => None,
    }
}

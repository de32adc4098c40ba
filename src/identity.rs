//! Accounts, credentials and sessions.

use crate::audit::{self, AuditEvent, Category, Outcome, Severity};
use crate::authz::{self, Actor, Role, ADMIN_ACTOR_ID};
use crate::config::{Argon2Cost, Config};
use crate::error::{CoreError, CoreResult};
use crate::model::{self, Page};
use crate::profiles::{self, ProfileInput};
use crate::token::{self, SessionClaims};
use crate::validate;
use anyhow::anyhow;
use argon2::{Algorithm, Argon2, Params, PasswordHasher, PasswordVerifier, Version};
use password_hash::{PasswordHash, SaltString};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use subtle::ConstantTimeEq;

const MAX_NAME_LEN: usize = 120;

fn hasher(cost: Argon2Cost) -> CoreResult<Argon2<'static>> {
    let params = Params::new(cost.m_kib, cost.t, cost.p, None)
        .map_err(|e| CoreError::Internal(anyhow!("invalid argon2 parameters: {}", e)))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

pub fn hash_password(password: &str, cost: Argon2Cost) -> CoreResult<String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| CoreError::Internal(anyhow!(e.to_string())))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| CoreError::Internal(anyhow!(e.to_string())))?;
    let phc = hasher(cost)?
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| CoreError::Internal(anyhow!(e.to_string())))?
        .to_string();
    Ok(phc)
}

/// Parameters are read from the PHC string, so hashes made under an older
/// cost keep verifying.
pub fn verify_password(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

static DUMMY_HASH: OnceLock<String> = OnceLock::new();

/// Burn one verification when the phone is unknown so the response time
/// matches a wrong password.
fn verify_against_dummy(password: &str, cost: Argon2Cost) {
    let hash = DUMMY_HASH.get_or_init(|| {
        hash_password("not-a-real-password-0", cost).unwrap_or_default()
    });
    let _ = verify_password(hash, password);
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub role: Role,
    pub active: bool,
    pub last_login_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

const ACCOUNT_COLUMNS: &str =
    "id, name, phone, role, active, last_login_at, created_at, updated_at";

fn row_to_account(r: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let role: String = r.get(3)?;
    Ok(Account {
        id: r.get(0)?,
        name: r.get(1)?,
        phone: r.get(2)?,
        role: Role::parse(&role).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
        active: r.get(4)?,
        last_login_at: r.get(5)?,
        created_at: r.get(6)?,
        updated_at: r.get(7)?,
    })
}

pub fn load_account(conn: &Connection, account_id: &str) -> CoreResult<Account> {
    conn.query_row(
        &format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS),
        [account_id],
        row_to_account,
    )
    .optional()?
    .ok_or(CoreError::NotFound("account"))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NewAccount {
    pub name: String,
    pub phone: String,
    pub password: String,
    pub role: String,
    #[serde(default)]
    pub profile: ProfileInput,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registered {
    pub account: Account,
    pub profile_id: String,
}

fn create_account(
    conn: &Connection,
    cfg: &Config,
    input: &NewAccount,
    active: bool,
    by: Option<&Actor>,
) -> CoreResult<Registered> {
    let name = validate::required_text(&input.name, "name", MAX_NAME_LEN)?;
    let phone = validate::phone(&input.phone)?;
    validate::password(&input.password)?;
    let role = Role::parse(&input.role).map_err(|_| CoreError::validation("unsupported role"))?;
    if role == Role::Admin {
        return Err(CoreError::validation(
            "administrator identities are not stored as accounts",
        ));
    }

    let existing: Option<String> = conn
        .query_row("SELECT id FROM accounts WHERE phone = ?", [&phone], |r| r.get(0))
        .optional()?;
    if existing.is_some() {
        return Err(CoreError::conflict("phone is already registered"));
    }

    let password_hash = hash_password(&input.password, cfg.argon2)?;
    let id = model::new_id();
    let now = model::now();

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO accounts(id, name, phone, password_hash, role, active, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        params![id, name, phone, password_hash, role.as_str(), active, now, now],
    )?;
    let profile_id = profiles::create_profile(&tx, &id, role, &input.profile, by.is_some())?;
    tx.commit()?;

    let (action, description) = match by {
        Some(_) => ("account.create", format!("created {} account {}", role, phone)),
        None => ("account.register", format!("registered {} account {}", role, phone)),
    };
    let mut event = AuditEvent::new(action, "account", Category::DataModification)
        .entity(&id)
        .describe(description)
        .details(json!({ "role": role, "profileId": profile_id, "active": active }));
    if let Some(actor) = by {
        event = event.by(actor);
    }
    audit::record(conn, event);

    Ok(Registered {
        account: load_account(conn, &id)?,
        profile_id,
    })
}

/// Self-registration. The account starts inactive until an administrator
/// activates it.
pub fn register(conn: &Connection, cfg: &Config, input: &NewAccount) -> CoreResult<Registered> {
    create_account(conn, cfg, input, false, None)
}

/// Administrator-created accounts are active immediately.
pub fn create_by_admin(
    conn: &Connection,
    cfg: &Config,
    actor: &Actor,
    input: &NewAccount,
) -> CoreResult<Registered> {
    authz::require_admin(actor)?;
    create_account(conn, cfg, input, true, Some(actor))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    pub expires_at: i64,
    pub account: Option<Account>,
    pub role: Role,
}

fn login_failed(conn: &Connection, phone: &str, account_id: Option<&str>, reason: &str) {
    tracing::info!(phone, reason, "login rejected");
    let mut event = AuditEvent::new("auth.login", "account", Category::Authentication)
        .describe(format!("login rejected for {}", phone))
        .details(json!({ "phone": phone, "reason": reason }))
        .outcome(Outcome::Failure, Severity::Medium);
    if let Some(id) = account_id {
        event = event.entity(id);
    }
    audit::record(conn, event);
}

pub fn authenticate(conn: &Connection, cfg: &Config, phone: &str, password: &str) -> CoreResult<Session> {
    let Ok(phone) = validate::phone(phone) else {
        verify_against_dummy(password, cfg.argon2);
        login_failed(conn, phone.trim(), None, "malformed phone");
        return Err(CoreError::InvalidCredentials);
    };

    let found: Option<(String, String, bool)> = conn
        .query_row(
            "SELECT id, password_hash, active FROM accounts WHERE phone = ?",
            [&phone],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((account_id, hash, active)) = found else {
        verify_against_dummy(password, cfg.argon2);
        login_failed(conn, &phone, None, "unknown phone");
        return Err(CoreError::InvalidCredentials);
    };

    if !verify_password(&hash, password) {
        login_failed(conn, &phone, Some(&account_id), "wrong password");
        return Err(CoreError::InvalidCredentials);
    }
    if !active {
        login_failed(conn, &phone, Some(&account_id), "inactive account");
        return Err(CoreError::AccountInactive);
    }

    let now = model::now();
    conn.execute(
        "UPDATE accounts SET last_login_at = ? WHERE id = ?",
        params![now, account_id],
    )?;
    let account = load_account(conn, &account_id)?;
    let claims = SessionClaims::new(&account.id, account.role, Some(&account.phone), cfg.token_ttl_hours);
    let token = token::issue(&claims, &cfg.token_secret)?;

    let actor = Actor::new(account.id.clone(), account.role);
    audit::record(
        conn,
        AuditEvent::new("auth.login", "account", Category::Authentication)
            .entity(&account.id)
            .by(&actor)
            .describe(format!("{} signed in", account.phone)),
    );
    tracing::info!(account = %account.id, role = %account.role, "login succeeded");

    Ok(Session {
        token,
        expires_at: claims.exp,
        role: account.role,
        account: Some(account),
    })
}

fn digest(secret: &str) -> Vec<u8> {
    Sha256::digest(secret.as_bytes()).to_vec()
}

/// The administrator is not an account: it signs in with the configured
/// shared secret, compared in constant time over fixed-length digests.
pub fn authenticate_admin(conn: &Connection, cfg: &Config, secret: &str) -> CoreResult<Session> {
    let accepted = match &cfg.admin_secret {
        Some(expected) => bool::from(digest(secret).as_slice().ct_eq(digest(expected).as_slice())),
        None => {
            tracing::warn!("admin login attempted but TUTORD_ADMIN_SECRET is not set");
            false
        }
    };
    let admin = Actor::new(ADMIN_ACTOR_ID, Role::Admin);
    if !accepted {
        audit::record(
            conn,
            AuditEvent::new("auth.admin_login", "admin", Category::Authentication)
                .describe("administrator login rejected")
                .outcome(Outcome::Failure, Severity::High),
        );
        return Err(CoreError::InvalidCredentials);
    }

    let claims = SessionClaims::new(ADMIN_ACTOR_ID, Role::Admin, None, cfg.token_ttl_hours);
    let token = token::issue(&claims, &cfg.token_secret)?;
    audit::record(
        conn,
        AuditEvent::new("auth.admin_login", "admin", Category::Authentication)
            .by(&admin)
            .describe("administrator signed in")
            .outcome(Outcome::Success, Severity::Medium),
    );
    Ok(Session {
        token,
        expires_at: claims.exp,
        account: None,
        role: Role::Admin,
    })
}

/// Turn a bearer token into the acting identity. Deactivated accounts lose
/// their sessions immediately.
pub fn resolve_session(conn: &Connection, cfg: &Config, bearer: &str) -> CoreResult<Actor> {
    let claims = token::verify(bearer, &cfg.token_secret)?;
    if claims.role == Role::Admin {
        if claims.sub != ADMIN_ACTOR_ID {
            return Err(CoreError::TokenInvalid);
        }
        return Ok(Actor::new(ADMIN_ACTOR_ID, Role::Admin));
    }
    let account = match load_account(conn, &claims.sub) {
        Ok(a) => a,
        Err(CoreError::NotFound(_)) => return Err(CoreError::TokenInvalid),
        Err(e) => return Err(e),
    };
    if account.role != claims.role {
        return Err(CoreError::TokenInvalid);
    }
    if !account.active {
        return Err(CoreError::AccountInactive);
    }
    Ok(Actor::new(account.id, account.role))
}

pub fn change_password(
    conn: &Connection,
    cfg: &Config,
    actor: &Actor,
    current: &str,
    new_password: &str,
) -> CoreResult<()> {
    if actor.is_admin() {
        return Err(CoreError::validation(
            "the administrator secret is managed through configuration",
        ));
    }
    let hash: String = conn
        .query_row(
            "SELECT password_hash FROM accounts WHERE id = ?",
            [&actor.id],
            |r| r.get(0),
        )
        .optional()?
        .ok_or(CoreError::NotFound("account"))?;
    if !verify_password(&hash, current) {
        audit::record(
            conn,
            AuditEvent::new("auth.change_password", "account", Category::Authentication)
                .entity(&actor.id)
                .by(actor)
                .describe("password change rejected")
                .outcome(Outcome::Failure, Severity::Medium),
        );
        return Err(CoreError::InvalidCredentials);
    }
    validate::password(new_password)?;
    if current == new_password {
        return Err(CoreError::validation("new password must differ from the current one"));
    }
    let new_hash = hash_password(new_password, cfg.argon2)?;
    conn.execute(
        "UPDATE accounts SET password_hash = ?, updated_at = ? WHERE id = ?",
        params![new_hash, model::now(), actor.id],
    )?;
    audit::record(
        conn,
        AuditEvent::new("auth.change_password", "account", Category::Authentication)
            .entity(&actor.id)
            .by(actor)
            .describe("password changed")
            .outcome(Outcome::Success, Severity::Medium),
    );
    Ok(())
}

// --- account administration ---

pub fn get_account(conn: &Connection, actor: &Actor, account_id: &str) -> CoreResult<Account> {
    let account = load_account(conn, account_id)?;
    profiles::require_access(conn, actor, authz::Action::Read, &account.id)?;
    Ok(account)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AccountFilter {
    pub role: Option<String>,
    pub active: Option<bool>,
    pub q: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub fn list_accounts(conn: &Connection, actor: &Actor, filter: &AccountFilter) -> CoreResult<Vec<Account>> {
    authz::require_admin(actor)?;
    let mut sql = format!("SELECT {} FROM accounts WHERE 1 = 1", ACCOUNT_COLUMNS);
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(role) = &filter.role {
        let role = Role::parse(role).map_err(|_| CoreError::validation("unsupported role"))?;
        sql.push_str(" AND role = ?");
        args.push(SqlValue::Text(role.as_str().to_string()));
    }
    if let Some(active) = filter.active {
        sql.push_str(" AND active = ?");
        args.push(SqlValue::Integer(i64::from(active)));
    }
    if let Some(q) = filter.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        sql.push_str(" AND (name LIKE ? OR phone LIKE ?)");
        let pattern = format!("%{}%", q);
        args.push(SqlValue::Text(pattern.clone()));
        args.push(SqlValue::Text(pattern));
    }
    let page = Page::new(filter.limit, filter.offset);
    sql.push_str(" ORDER BY created_at DESC, id LIMIT ? OFFSET ?");
    args.push(SqlValue::Integer(page.limit));
    args.push(SqlValue::Integer(page.offset));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), row_to_account)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn set_active(conn: &Connection, actor: &Actor, account_id: &str, active: bool) -> CoreResult<Account> {
    authz::require_admin(actor)?;
    let before = load_account(conn, account_id)?;
    conn.execute(
        "UPDATE accounts SET active = ?, updated_at = ? WHERE id = ?",
        params![active, model::now(), account_id],
    )?;
    audit::record(
        conn,
        AuditEvent::new(
            if active { "account.activate" } else { "account.deactivate" },
            "account",
            Category::Authorization,
        )
        .entity(account_id)
        .by(actor)
        .describe(format!("{} is now {}", before.phone, if active { "active" } else { "inactive" }))
        .details(json!({ "before": before.active, "after": active }))
        .outcome(Outcome::Success, Severity::Medium),
    );
    load_account(conn, account_id)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AccountPatch {
    pub name: Option<String>,
    pub phone: Option<String>,
}

pub fn update_account(conn: &Connection, actor: &Actor, account_id: &str, patch: &AccountPatch) -> CoreResult<Account> {
    authz::require_admin(actor)?;
    let before = load_account(conn, account_id)?;
    let name = match &patch.name {
        Some(n) => validate::required_text(n, "name", MAX_NAME_LEN)?,
        None => before.name.clone(),
    };
    let phone = match &patch.phone {
        Some(p) => validate::phone(p)?,
        None => before.phone.clone(),
    };
    if phone != before.phone {
        let taken: Option<String> = conn
            .query_row(
                "SELECT id FROM accounts WHERE phone = ? AND id <> ?",
                params![phone, account_id],
                |r| r.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(CoreError::conflict("phone is already registered"));
        }
    }
    conn.execute(
        "UPDATE accounts SET name = ?, phone = ?, updated_at = ? WHERE id = ?",
        params![name, phone, model::now(), account_id],
    )?;
    audit::record(
        conn,
        AuditEvent::new("account.update", "account", Category::DataModification)
            .entity(account_id)
            .by(actor)
            .describe(format!("updated account {}", before.phone))
            .details(json!({
                "before": { "name": before.name, "phone": before.phone },
                "after": { "name": name, "phone": phone },
            })),
    );
    load_account(conn, account_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHEAP: Argon2Cost = Argon2Cost {
        m_kib: 1024,
        t: 1,
        p: 1,
    };

    #[test]
    fn hashes_verify_and_carry_their_own_parameters() {
        let hash = hash_password("lesson2024", CHEAP).expect("hash");
        assert!(hash.starts_with("$argon2id$"));
        assert!(hash.contains("m=1024"));
        assert!(verify_password(&hash, "lesson2024"));
        assert!(!verify_password(&hash, "lesson2025"));
        assert!(!verify_password("not-a-phc-string", "lesson2024"));
    }

    #[test]
    fn salts_differ_between_hashes() {
        let a = hash_password("lesson2024", CHEAP).expect("hash");
        let b = hash_password("lesson2024", CHEAP).expect("hash");
        assert_ne!(a, b);
    }
}

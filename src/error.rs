use rusqlite::ffi;
use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

/// Failure taxonomy shared by every core operation. Each variant has a
/// stable wire code; the credential and token variants all belong to the
/// `unauthorized` family.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),
    #[error("invalid phone or password")]
    InvalidCredentials,
    #[error("account is not active")]
    AccountInactive,
    #[error("session token is invalid")]
    TokenInvalid,
    #[error("session token has expired")]
    TokenExpired,
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InvalidState(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        CoreError::Forbidden(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::Conflict(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        CoreError::InvalidState(msg.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation_error",
            CoreError::InvalidCredentials => "invalid_credentials",
            CoreError::AccountInactive => "account_inactive",
            CoreError::TokenInvalid => "token_invalid",
            CoreError::TokenExpired => "token_expired",
            CoreError::Unauthorized(_) => "unauthorized",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::InvalidState(_) => "invalid_state",
            CoreError::Internal(_) => "internal_error",
        }
    }

    /// Coarse family for transports that only distinguish broad failure kinds.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidCredentials
            | CoreError::AccountInactive
            | CoreError::TokenInvalid
            | CoreError::TokenExpired
            | CoreError::Unauthorized(_) => "unauthorized",
            other => other.code(),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref failure, ref msg) = e {
            if failure.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || failure.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            {
                let detail = msg.clone().unwrap_or_else(|| "duplicate key".to_string());
                return CoreError::Conflict(describe_unique_violation(&detail));
            }
        }
        CoreError::Internal(anyhow::Error::new(e))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Internal(anyhow::Error::new(e))
    }
}

// SQLite reports "UNIQUE constraint failed: accounts.phone"; keep the column
// but drop the engine wording.
fn describe_unique_violation(detail: &str) -> String {
    match detail.rsplit_once(": ") {
        Some((_, cols)) => format!("duplicate value for {}", cols),
        None => detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_errors_share_unauthorized_kind() {
        assert_eq!(CoreError::InvalidCredentials.kind(), "unauthorized");
        assert_eq!(CoreError::TokenExpired.kind(), "unauthorized");
        assert_eq!(CoreError::TokenExpired.code(), "token_expired");
        assert_eq!(CoreError::NotFound("class").kind(), "not_found");
        assert_eq!(CoreError::NotFound("class").to_string(), "class not found");
    }

    #[test]
    fn unique_violation_maps_to_conflict() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        conn.execute("CREATE TABLE t(phone TEXT NOT NULL UNIQUE)", [])
            .expect("create");
        conn.execute("INSERT INTO t(phone) VALUES('01012345678')", [])
            .expect("first insert");
        let e: CoreError = conn
            .execute("INSERT INTO t(phone) VALUES('01012345678')", [])
            .expect_err("duplicate")
            .into();
        assert_eq!(e.code(), "conflict");
        assert!(e.to_string().contains("t.phone"), "{}", e);
    }
}

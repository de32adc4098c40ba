//! Role and ownership resolution.
//!
//! Decisions are made in two phases. `authorize` is a pure pre-check that
//! settles admin, self-access and every denial it can prove without data.
//! A guardian acting on someone else's resource gets a
//! `PendingOwnershipCheck`, which the caller resolves once the guardian's
//! dependents are loaded.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
    Guardian,
}

impl Role {
    pub fn parse(s: &str) -> CoreResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "teacher" => Ok(Self::Teacher),
            "student" => Ok(Self::Student),
            "guardian" | "parent" => Ok(Self::Guardian),
            _ => Err(CoreError::forbidden("unsupported role")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Teacher => "teacher",
            Self::Student => "student",
            Self::Guardian => "guardian",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Update,
    Pay,
    /// Operations reserved for the administrator (cancel, refund, invoicing).
    Administer,
}

/// The authenticated identity performing a request. `id` is an account id,
/// or `ADMIN_ACTOR_ID` for the distinguished administrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

pub const ADMIN_ACTOR_ID: &str = "admin";

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
    Pending(PendingOwnershipCheck),
}

/// Second phase of a guardian decision: the owner must be one of the
/// guardian's dependents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOwnershipCheck {
    pub guardian_id: String,
    pub owner: String,
}

impl PendingOwnershipCheck {
    pub fn resolve<S: AsRef<str>>(&self, children: &[S]) -> Decision {
        if children.iter().any(|c| c.as_ref() == self.owner) {
            Decision::Allow
        } else {
            Decision::Deny("resource does not belong to a dependent of this guardian".into())
        }
    }
}

pub fn authorize(actor: &Actor, action: Action, owner: &str) -> Decision {
    match actor.role {
        Role::Admin => Decision::Allow,
        _ if action == Action::Administer => {
            Decision::Deny(format!("{} may not perform this operation", actor.role))
        }
        Role::Teacher | Role::Student => {
            if actor.id == owner {
                Decision::Allow
            } else {
                Decision::Deny("resource belongs to another account".into())
            }
        }
        Role::Guardian => {
            if actor.id == owner {
                Decision::Allow
            } else {
                Decision::Pending(PendingOwnershipCheck {
                    guardian_id: actor.id.clone(),
                    owner: owner.to_string(),
                })
            }
        }
    }
}

/// Run both phases, loading the guardian's dependents only when needed.
pub fn require<F>(actor: &Actor, action: Action, owner: &str, load_children: F) -> CoreResult<()>
where
    F: FnOnce(&str) -> CoreResult<Vec<String>>,
{
    let decision = match authorize(actor, action, owner) {
        Decision::Pending(check) => {
            let children = load_children(&check.guardian_id)?;
            check.resolve(children.as_slice())
        }
        other => other,
    };
    match decision {
        Decision::Allow => Ok(()),
        Decision::Deny(reason) => Err(CoreError::Forbidden(reason)),
        Decision::Pending(_) => Err(CoreError::forbidden("ownership could not be resolved")),
    }
}

pub fn require_admin(actor: &Actor) -> CoreResult<()> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(CoreError::forbidden("administrator access required"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SELF_ID: &str = "acc-self";
    const OTHER_ID: &str = "acc-other";
    const CHILD_ID: &str = "acc-child";

    fn allowed(d: &Decision) -> bool {
        matches!(d, Decision::Allow)
    }

    fn authorize_with_children(actor: &Actor, action: Action, owner: &str, children: &[String]) -> Decision {
        match authorize(actor, action, owner) {
            Decision::Pending(check) => check.resolve(children),
            other => other,
        }
    }

    #[test]
    fn truth_table_for_every_role_and_relation() {
        let children = vec![CHILD_ID.to_string()];
        let cases = [
            // role, owner, expected
            (Role::Admin, SELF_ID, true),
            (Role::Admin, OTHER_ID, true),
            (Role::Admin, CHILD_ID, true),
            (Role::Teacher, SELF_ID, true),
            (Role::Teacher, OTHER_ID, false),
            (Role::Teacher, CHILD_ID, false),
            (Role::Student, SELF_ID, true),
            (Role::Student, OTHER_ID, false),
            (Role::Student, CHILD_ID, false),
            (Role::Guardian, SELF_ID, true),
            (Role::Guardian, OTHER_ID, false),
            (Role::Guardian, CHILD_ID, true),
        ];
        for (role, owner, expected) in cases {
            let actor = Actor::new(SELF_ID, role);
            for action in [Action::Read, Action::Update, Action::Pay] {
                let d = authorize_with_children(&actor, action, owner, children.as_slice());
                assert_eq!(
                    allowed(&d),
                    expected,
                    "role={} owner={} action={:?}",
                    role,
                    owner,
                    action
                );
            }
        }
    }

    #[test]
    fn guardian_pre_check_defers_until_children_known() {
        let actor = Actor::new(SELF_ID, Role::Guardian);
        let Decision::Pending(check) = authorize(&actor, Action::Pay, CHILD_ID) else {
            panic!("expected pending check");
        };
        assert_eq!(check.guardian_id, SELF_ID);
        assert_eq!(check.owner, CHILD_ID);
        assert!(allowed(&check.resolve(&[CHILD_ID][..])));
        assert!(!allowed(&check.resolve::<&str>(&[])));
    }

    #[test]
    fn administer_is_admin_only() {
        assert!(allowed(&authorize(
            &Actor::new(ADMIN_ACTOR_ID, Role::Admin),
            Action::Administer,
            OTHER_ID
        )));
        for role in [Role::Teacher, Role::Student, Role::Guardian] {
            let d = authorize_with_children(
                &Actor::new(SELF_ID, role),
                Action::Administer,
                SELF_ID,
                &[SELF_ID.to_string()],
            );
            assert!(matches!(d, Decision::Deny(_)), "{}", role);
        }
    }

    #[test]
    fn require_only_loads_children_for_guardians() {
        let teacher = Actor::new(SELF_ID, Role::Teacher);
        let r = require(&teacher, Action::Read, OTHER_ID, |_| {
            panic!("teacher decisions never need dependents")
        });
        assert!(matches!(r, Err(CoreError::Forbidden(_))));

        let guardian = Actor::new(SELF_ID, Role::Guardian);
        let r = require(&guardian, Action::Read, CHILD_ID, |g| {
            assert_eq!(g, SELF_ID);
            Ok(vec![CHILD_ID.to_string()])
        });
        assert!(r.is_ok());
    }

    #[test]
    fn unknown_role_is_unsupported() {
        let e = Role::parse("janitor").expect_err("unknown role");
        assert_eq!(e.code(), "forbidden");
        assert_eq!(e.to_string(), "unsupported role");
        assert_eq!(Role::parse(" Parent ").expect("alias"), Role::Guardian);
    }
}

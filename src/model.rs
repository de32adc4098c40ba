//! Value types shared across the ledger, reconciler and profile stores.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Deserialize;

/// Declares a closed set of lowercase textual states that round-trip through
/// JSON and SQLite unchanged.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(self.as_str())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let raw = <String as serde::Deserialize>::deserialize(d)?;
                $name::parse(&raw).ok_or_else(|| {
                    let allowed: Vec<&str> = $name::ALL.iter().map(|v| v.as_str()).collect();
                    serde::de::Error::custom(format!(
                        "unknown value '{}', expected one of: {}",
                        raw,
                        allowed.join(", ")
                    ))
                })
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                let s = value.as_str()?;
                $name::parse(s).ok_or_else(|| {
                    rusqlite::types::FromSqlError::Other(
                        format!("invalid {} value: {}", stringify!($name), s).into(),
                    )
                })
            }
        }

        impl rusqlite::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }
    };
}

text_enum!(AttendanceStatus {
    Present => "present",
    Absent => "absent",
    Late => "late",
    Excused => "excused",
});

impl AttendanceStatus {
    /// Statuses that notify the student and their guardian.
    pub fn needs_follow_up(self) -> bool {
        matches!(self, Self::Absent | Self::Late)
    }
}

text_enum!(JustificationStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

text_enum!(PaymentStatus {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
    Refunded => "refunded",
});

impl PaymentStatus {
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Completed) | (Pending, Cancelled) | (Pending, Failed) | (Completed, Refunded)
        )
    }
}

text_enum!(PaymentType {
    Tuition => "tuition",
    Registration => "registration",
    Materials => "materials",
    Exam => "exam",
    Transport => "transport",
    Other => "other",
});

text_enum!(PaymentMethod {
    Cash => "cash",
    Card => "card",
    BankTransfer => "bank_transfer",
    MobileWallet => "mobile_wallet",
    Online => "online",
});

text_enum!(ClassStatus {
    Active => "active",
    Inactive => "inactive",
    Completed => "completed",
    Cancelled => "cancelled",
});

text_enum!(NotificationStatus {
    Sent => "sent",
    Delivered => "delivered",
    Read => "read",
    Failed => "failed",
});

text_enum!(NotificationType {
    Attendance => "attendance",
    Payment => "payment",
    Announcement => "announcement",
    General => "general",
});

text_enum!(Priority {
    Low => "low",
    Normal => "normal",
    High => "high",
    Urgent => "urgent",
});

text_enum!(Weekday {
    Saturday => "saturday",
    Sunday => "sunday",
    Monday => "monday",
    Tuesday => "tuesday",
    Wednesday => "wednesday",
    Thursday => "thursday",
    Friday => "friday",
});

/// Delivery channel flags carried by notifications and guardian preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Channels {
    #[serde(default)]
    pub sms: bool,
    #[serde(default)]
    pub email: bool,
    #[serde(default)]
    pub push: bool,
    #[serde(default = "default_true")]
    pub in_app: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Channels {
    fn default() -> Self {
        Self {
            sms: false,
            email: false,
            push: false,
            in_app: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 200;

impl Page {
    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
            offset: offset.unwrap_or(0).max(0),
        }
    }
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now() -> String {
    timestamp(Utc::now())
}

pub fn expires_after_days(days: i64) -> String {
    timestamp(Utc::now() + Duration::days(days))
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_state_machine_edges() {
        use PaymentStatus::*;
        assert!(Pending.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Pending.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Refunded));
        for terminal in [Cancelled, Failed, Refunded] {
            for next in PaymentStatus::ALL {
                assert!(!terminal.can_transition_to(*next), "{} -> {}", terminal, next);
            }
        }
        assert!(!Completed.can_transition_to(Cancelled));
    }

    #[test]
    fn text_enums_round_trip_through_json() {
        let v = serde_json::to_value(PaymentMethod::BankTransfer).expect("ser");
        assert_eq!(v, "bank_transfer");
        let back: AttendanceStatus = serde_json::from_value(serde_json::json!("Late")).expect("de");
        assert_eq!(back, AttendanceStatus::Late);
        assert!(serde_json::from_value::<ClassStatus>(serde_json::json!("paused")).is_err());
    }

    #[test]
    fn page_is_clamped() {
        let p = Page::new(Some(10_000), Some(-5));
        assert_eq!(p, Page { limit: MAX_PAGE_SIZE, offset: 0 });
        assert_eq!(Page::new(None, None).limit, DEFAULT_PAGE_SIZE);
        assert_eq!(Page::new(Some(0), None).limit, 1);
    }
}

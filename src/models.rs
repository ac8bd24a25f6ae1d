//! Row types shared by the dashboards.
//!
//! Field names follow the backend's column names; enum values are the
//! literal strings stored in the tables.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const USERS: &str = "users";
pub const ROUTINES: &str = "routines";
pub const ATTENDANCES: &str = "attendances";
pub const PUSH_SUBSCRIPTIONS: &str = "push_subscriptions";

/// Object storage bucket holding routine PDFs.
pub const ROUTINES_BUCKET: &str = "routines";

/// Row identifier. Backends hand out either text (uuid) or integer keys,
/// both are kept as text.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RowId(pub String);

impl<'de> Deserialize<'de> for RowId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Int(i64),
            Float(f64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(text) => RowId(text),
            Raw::Int(n) => RowId(n.to_string()),
            Raw::Float(n) => RowId(n.to_string()),
        })
    }
}

impl RowId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::String(self.0.clone())
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowId {
    fn from(value: &str) -> Self {
        RowId(value.to_string())
    }
}

/// Treats an explicit `null` the same as a missing field.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Instructor,
    Student,
    Other(String),
}

impl Role {
    pub const INSTRUCTOR: &'static str = "PROFESOR";
    pub const STUDENT: &'static str = "ALUMNO";

    pub fn parse(value: &str) -> Self {
        match value {
            Self::INSTRUCTOR => Role::Instructor,
            Self::STUDENT => Role::Student,
            other => Role::Other(other.to_string()),
        }
    }
}

/// Login-gating account status. Anything other than `ACTIVO` counts as
/// inactive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AccountStatus {
    #[default]
    Active,
    Inactive,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "ACTIVO",
            AccountStatus::Inactive => "INACTIVO",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            AccountStatus::Active => AccountStatus::Inactive,
            AccountStatus::Inactive => AccountStatus::Active,
        }
    }
}

impl From<String> for AccountStatus {
    fn from(value: String) -> Self {
        if value == "ACTIVO" {
            AccountStatus::Active
        } else {
            AccountStatus::Inactive
        }
    }
}

impl From<AccountStatus> for String {
    fn from(value: AccountStatus) -> Self {
        value.as_str().to_string()
    }
}

/// Membership fee status shown as a badge next to the student.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FeeStatus {
    #[default]
    UpToDate,
    DueSoon,
    Expired,
    Unknown,
}

impl FeeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeStatus::UpToDate => "AL_DIA",
            FeeStatus::DueSoon => "POR_VENCER",
            FeeStatus::Expired => "VENCIDA",
            FeeStatus::Unknown => "",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FeeStatus::UpToDate => "Up to date",
            FeeStatus::DueSoon => "Due soon",
            FeeStatus::Expired => "Fee expired",
            FeeStatus::Unknown => "",
        }
    }
}

impl From<String> for FeeStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "AL_DIA" => FeeStatus::UpToDate,
            "POR_VENCER" => FeeStatus::DueSoon,
            "VENCIDA" => FeeStatus::Expired,
            _ => FeeStatus::Unknown,
        }
    }
}

impl From<FeeStatus> for String {
    fn from(value: FeeStatus) -> Self {
        value.as_str().to_string()
    }
}

/// A full `users` row. Only ever held server-side; the password never
/// leaves [`crate::login`].
#[derive(Clone, Debug, Deserialize)]
pub struct User {
    pub id: RowId,
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub role: String,
    #[serde(default, deserialize_with = "nullable")]
    pub status: AccountStatus,
    #[serde(default)]
    pub cuota_status: Option<FeeStatus>,
    #[serde(default)]
    pub gym_id: Option<RowId>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// The trimmed user record kept in the session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: RowId,
    pub name: String,
    pub username: String,
    pub role: String,
    pub status: AccountStatus,
    pub cuota_status: Option<FeeStatus>,
    pub gym_id: Option<RowId>,
}

impl From<User> for SessionUser {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            name: user.name,
            username: user.username,
            role: user.role,
            status: user.status,
            cuota_status: user.cuota_status,
            gym_id: user.gym_id,
        }
    }
}

impl SessionUser {
    pub fn role(&self) -> Role {
        Role::parse(&self.role)
    }

    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }

    /// The gym id as a JSON value for inserts (`null` when unset).
    pub fn gym_value(&self) -> Value {
        self.gym_id.as_ref().map(RowId::to_value).unwrap_or(Value::Null)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Routine {
    pub id: RowId,
    #[serde(rename = "nombre", default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub file_url: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub student_id: Option<RowId>,
    #[serde(default)]
    pub gym_id: Option<RowId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Attendance {
    pub id: RowId,
    #[serde(default, deserialize_with = "nullable")]
    pub date: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub student_id: Option<RowId>,
}

impl Attendance {
    pub const PRESENT: &'static str = "PRESENTE";

    pub fn status_label(&self) -> &str {
        self.status.as_deref().unwrap_or(Self::PRESENT)
    }

    pub fn is_present(&self) -> bool {
        self.status_label() == Self::PRESENT
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

/// Browser-issued push endpoint descriptor (`PushSubscription.toJSON()`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SubscriptionRow {
    pub user_id: RowId,
    pub subscription: Value,
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::Error;

use super::selection::Variant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    #[serde(rename = "canteen_a")]
    StaffA,
    #[serde(rename = "canteen_b")]
    StaffB,
    #[serde(rename = "canteen_test")]
    StaffTest,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::StaffA => "canteen_a",
            Role::StaffB => "canteen_b",
            Role::StaffTest => "canteen_test",
        }
    }

    /// Variant handed out at this operator's serving window.
    pub fn serving_variant(self) -> Option<Variant> {
        match self {
            Role::StaffA => Some(Variant::A),
            Role::StaffB => Some(Variant::B),
            Role::Admin | Role::StaffTest => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "canteen_a" => Ok(Role::StaffA),
            "canteen_b" => Ok(Role::StaffB),
            "canteen_test" => Ok(Role::StaffTest),
            _ => Err(Error::validation(format!("unknown staff role: {s}"))),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Staff {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub full_name: String,
    #[sqlx(try_from = "String")]
    pub role: Role,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewStaff {
    pub username: String,
    pub password: String,
    pub full_name: String,
    pub role: Role,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaffUpdate {
    pub full_name: Option<String>,
    pub role: Option<Role>,
    pub password: Option<String>,
    pub external_id: Option<String>,
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    A,
    B,
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Variant::A => "A",
            Variant::B => "B",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Variant::A => Variant::B,
            Variant::B => Variant::A,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "A" | "a" => Ok(Variant::A),
            "B" | "b" => Ok(Variant::B),
            other => Err(Error::validation(format!("unknown meal variant: {other}"))),
        }
    }
}

impl TryFrom<String> for Variant {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Selection {
    pub id: i64,
    pub student_id: i64,
    pub meal_id: i64,
    #[sqlx(try_from = "String")]
    pub variant: Variant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantCounts {
    pub a: i64,
    pub b: i64,
}

impl VariantCounts {
    pub fn total(&self) -> i64 {
        self.a + self.b
    }

    pub fn bump(&mut self, v: Variant) {
        match v {
            Variant::A => self.a += 1,
            Variant::B => self.b += 1,
        }
    }

    /// The less represented variant, or `None` on a tie.
    pub fn minority(&self) -> Option<Variant> {
        match self.a.cmp(&self.b) {
            std::cmp::Ordering::Less => Some(Variant::A),
            std::cmp::Ordering::Greater => Some(Variant::B),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// Student ids per outcome for one meal cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MealBreakdown {
    pub a: Vec<i64>,
    pub b: Vec<i64>,
    pub unselected: Vec<i64>,
}

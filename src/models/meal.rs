use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Meal {
    pub id: i64,
    pub name: String,
    pub selection_start: NaiveDateTime,
    pub selection_end: NaiveDateTime,
    pub effective_start: NaiveDateTime,
    pub effective_end: NaiveDateTime,
    /// Relative to the configured image directory; empty when no image.
    #[sqlx(rename = "image_path")]
    pub image_ref: String,
}

impl Meal {
    /// Both ends of the selection window are inclusive.
    pub fn is_selectable_at(&self, now: NaiveDateTime) -> bool {
        self.selection_start <= now && now <= self.selection_end
    }

    pub fn is_effective_at(&self, now: NaiveDateTime) -> bool {
        self.effective_start <= now && now <= self.effective_end
    }
}

/// Fields an administrator supplies when creating or replacing a meal cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MealDraft {
    pub name: String,
    pub selection_start: NaiveDateTime,
    pub selection_end: NaiveDateTime,
    pub effective_start: NaiveDateTime,
    pub effective_end: NaiveDateTime,
    #[serde(default)]
    pub image_ref: String,
}

impl MealDraft {
    /// Row-local window rules. Overlap with other cycles needs the store and
    /// is checked by the catalog inside its transaction.
    pub fn validate_windows(&self, now: NaiveDateTime) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("meal name must not be empty"));
        }
        if self.selection_start >= self.selection_end {
            return Err(Error::validation("selection start must be before selection end"));
        }
        if self.effective_start > self.effective_end {
            return Err(Error::validation("effective start must not be after effective end"));
        }
        if self.effective_end < now {
            return Err(Error::validation("effective end is already in the past"));
        }
        if self.effective_start <= self.selection_end {
            return Err(Error::validation(
                "effective window must start after the selection window ends",
            ));
        }
        Ok(())
    }
}

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::{
    clock::Clock,
    error::{Error, Result},
    models::{collection::PresentationResult, staff::Role},
    services::{selection::SelectionEngine, students::StudentService, token::TokenCipher},
};

/// Serving-window scans: one recorded collection per student per day.
#[derive(Clone)]
pub struct CollectionRecorder {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    tokens: TokenCipher,
    selections: SelectionEngine,
}

impl CollectionRecorder {
    pub fn new(
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        tokens: TokenCipher,
        selections: SelectionEngine,
    ) -> Self {
        Self { pool, clock, tokens, selections }
    }

    /// Reports the student's state and records a collection when the scan
    /// happens at the window serving their variant for the first time today.
    ///
    /// Mismatches and repeat scans are reported, never rejected.
    pub async fn record_presentation(&self, operator: Role, token: &str) -> Result<PresentationResult> {
        if operator == Role::Admin {
            return Err(Error::validation("only serving-window staff can scan meal cards"));
        }
        let student_id = self.tokens.decode(token)?;
        let expected = operator.serving_variant();

        let student = StudentService::get(&self.pool, student_id).await?;
        let selection = self.selections.active_selection(student_id).await?;
        let today = self.clock.today();

        let mut result = PresentationResult {
            student_id,
            student_name: student.full_name.clone(),
            has_selected: selection.is_some(),
            selected_variant: selection.as_ref().map(|s| s.variant),
            expected_variant: expected,
            already_collected_today: student.last_collection_day == Some(today),
            collection_recorded: false,
        };

        if operator == Role::StaffTest {
            debug!("test scan for student {student_id}");
            return Ok(result);
        }
        if !result.variant_matches() || result.already_collected_today {
            return Ok(result);
        }

        let won = StudentService::advance_collection_day(
            &self.pool,
            student_id,
            student.last_collection_day,
            today,
        )
        .await?;
        if won {
            result.collection_recorded = true;
            info!("student {student_id} collected meal {}", result.selected_variant.map_or("-", |v| v.as_str()));
        } else {
            // another window got there first
            result.already_collected_today = true;
        }
        Ok(result)
    }
}

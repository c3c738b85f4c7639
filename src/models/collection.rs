use serde::{Deserialize, Serialize};

use super::selection::Variant;

/// What the serving window shows after a token scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationResult {
    pub student_id: i64,
    pub student_name: String,
    pub has_selected: bool,
    pub selected_variant: Option<Variant>,
    pub expected_variant: Option<Variant>,
    #[serde(rename = "has_collected_today")]
    pub already_collected_today: bool,
    /// Whether this scan advanced the collection day.
    pub collection_recorded: bool,
}

impl PresentationResult {
    pub fn variant_matches(&self) -> bool {
        self.selected_variant.is_some() && self.selected_variant == self.expected_variant
    }
}

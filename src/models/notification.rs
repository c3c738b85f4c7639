use serde::{Deserialize, Serialize};

/// A push card with a single call-to-action link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCard {
    pub title: String,
    pub markdown_body: String,
    pub link_label: String,
    pub link_href: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyReport {
    pub recipients: usize,
    pub batches_sent: usize,
    pub batches_failed: usize,
}

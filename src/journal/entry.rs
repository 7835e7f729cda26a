//! Journal entries: one timestamped, labeled block of markdown.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// A single append-only journal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub timestamp: Timestamp,
    /// Who wrote the entry (e.g. `steward` or a session label).
    pub source_label: String,
    /// What kind of entry this is (e.g. `recovery`).
    pub category: String,
    pub body: String,
}

impl JournalEntry {
    /// Creates an entry stamped with the current time.
    pub fn now(
        source_label: impl Into<String>,
        category: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Timestamp::now(),
            source_label: source_label.into(),
            category: category.into(),
            body: body.into(),
        }
    }

    /// Renders the entry as a `## ` sub-block suitable for a journal section.
    pub fn render(&self) -> String {
        format!(
            "## {} [{}] {}\n\n{}\n",
            self.timestamp.strftime("%Y-%m-%d %H:%M:%S UTC"),
            self.source_label,
            self.category,
            self.body.trim_end()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_heading_and_body() {
        let entry = JournalEntry {
            timestamp: Timestamp::new(1_700_000_000, 0).unwrap(),
            source_label: "steward".into(),
            category: "recovery".into(),
            body: "- `make test`\n\n".into(),
        };

        assert_eq!(
            entry.render(),
            "## 2023-11-14 22:13:20 UTC [steward] recovery\n\n- `make test`\n"
        );
    }
}

//! Read-only report queries over stored messages
//!
//! Nothing here touches sync state. Listings come back newest first.

use anyhow::{Result, bail};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{MessageId, MessageRecord, display_subject};
use crate::storage::{MessageQuery, MessageStore};

/// Largest page size accepted by [`ReportFilter::paged`]
pub const MAX_PER_PAGE: usize = 100;

const RULE_WIDTH: usize = 80;

/// Time window for a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportWindow {
    /// Messages received in the last N days
    LastDays(u32),
    /// Messages received between two instants, inclusive
    Range {
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    },
}

/// Filters accepted by the report surface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFilter {
    pub window: Option<ReportWindow>,
    /// Case-insensitive sender substring
    pub sender: Option<String>,
    pub processed: Option<bool>,
    /// 1-based page and its size; None lists everything
    pub page: Option<(usize, usize)>,
}

impl ReportFilter {
    pub fn last_days(days: u32) -> Self {
        Self {
            window: Some(ReportWindow::LastDays(days)),
            ..Default::default()
        }
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        let sender = sender.into();
        self.sender = (!sender.trim().is_empty()).then_some(sender);
        self
    }

    pub fn processed(mut self, processed: bool) -> Self {
        self.processed = Some(processed);
        self
    }

    pub fn window(mut self, window: ReportWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn paged(mut self, page: usize, per_page: usize) -> Self {
        self.page = Some((page, per_page));
        self
    }

    /// Translate into a store query, resolving relative windows against `now`
    pub fn to_query(&self, now: DateTime<Utc>) -> Result<MessageQuery> {
        let mut query = MessageQuery {
            sender_contains: self.sender.clone(),
            processed: self.processed,
            ..Default::default()
        };

        match self.window {
            Some(ReportWindow::LastDays(days)) => {
                let since = Duration::try_days(i64::from(days))
                    .and_then(|span| now.checked_sub_signed(span));
                match since {
                    Some(since) => query.received_since = Some(since),
                    None => bail!("Report window of {} days is out of range", days),
                }
            }
            Some(ReportWindow::Range { since, until }) => {
                if since > until {
                    bail!("Report range starts after it ends ({} > {})", since, until);
                }
                query.received_since = Some(since);
                query.received_until = Some(until);
            }
            None => {}
        }

        if let Some((page, per_page)) = self.page {
            if page == 0 {
                bail!("Page numbers start at 1");
            }
            if per_page == 0 || per_page > MAX_PER_PAGE {
                bail!("Page size must be between 1 and {}", MAX_PER_PAGE);
            }
            query.limit = per_page;
            query.offset = (page - 1) * per_page;
        }

        Ok(query)
    }

    /// Heading used when printing a listing
    pub fn title(&self) -> String {
        let mut title = match self.processed {
            Some(true) => "Processed messages".to_string(),
            Some(false) => "Unprocessed messages".to_string(),
            None => "Messages".to_string(),
        };
        match self.window {
            Some(ReportWindow::LastDays(1)) => title.push_str(" from the last 24 hours"),
            Some(ReportWindow::LastDays(days)) => {
                title.push_str(&format!(" from the last {} days", days))
            }
            Some(ReportWindow::Range { since, until }) => title.push_str(&format!(
                " between {} and {}",
                since.format("%Y-%m-%d"),
                until.format("%Y-%m-%d")
            )),
            None => {}
        }
        if let Some(sender) = &self.sender {
            title.push_str(&format!(" from {}", sender));
        }
        if let Some((page, _)) = self.page {
            title.push_str(&format!(" (page {})", page));
        }
        title
    }
}

/// List messages matching a report filter
pub fn list_report(
    store: &dyn MessageStore,
    filter: &ReportFilter,
    now: DateTime<Utc>,
) -> Result<Vec<MessageRecord>> {
    let query = filter.to_query(now)?;
    store.list_messages(&query)
}

/// Load one message for the detail view
pub fn get_message_detail(store: &dyn MessageStore, id: &MessageId) -> Result<Option<MessageRecord>> {
    store.get_message(id)
}

/// Render a numbered summary listing
pub fn format_summary_list(title: &str, messages: &[MessageRecord]) -> String {
    if messages.is_empty() {
        return format!("No {} found.", title.to_lowercase());
    }

    let mut out = format!("{} ({}):\n", title, messages.len());
    for (i, message) in messages.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, message.summary_line()));
    }
    out
}

/// Render the full detail block for a message
pub fn format_message_detail(message: &MessageRecord) -> String {
    let heavy = "=".repeat(RULE_WIDTH);
    let light = "-".repeat(RULE_WIDTH);
    format!(
        "{heavy}\nSubject: {}\nFrom: {}\nDate: {}\nProcessed: {}\n{light}\nBody:\n{light}\n{}\n{heavy}\n",
        display_subject(&message.subject),
        message.sender,
        message.received_at.format("%Y-%m-%d %H:%M:%S"),
        if message.processed { "yes" } else { "no" },
        message.body,
    )
}

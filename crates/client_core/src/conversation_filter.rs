use std::fmt;

use chrono::NaiveDate;
use shared::protocol::Conversation;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationFilter {
    /// Both bounds inclusive, compared by UTC calendar day.
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub query: Option<String>,
}

impl ConversationFilter {
    /// Range covering the earliest through latest creation day in the list.
    pub fn spanning(conversations: &[Conversation]) -> Self {
        let mut days = conversations
            .iter()
            .filter_map(|c| c.date_created.map(|d| d.date_naive()));
        let first = days.next();
        let (start, end) = days.fold((first, first), |(lo, hi), day| {
            (lo.min(Some(day)), hi.max(Some(day)))
        });
        Self {
            start,
            end,
            query: None,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.query = (!query.is_empty()).then_some(query);
        self
    }

    pub fn with_range(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        if start.is_some() {
            self.start = start;
        }
        if end.is_some() {
            self.end = end;
        }
        self
    }

    /// Conversations without a creation date are kept regardless of range.
    pub fn matches(&self, conversation: &Conversation) -> bool {
        if let Some(day) = conversation.date_created.map(|d| d.date_naive()) {
            if self.start.is_some_and(|start| day < start) {
                return false;
            }
            if self.end.is_some_and(|end| day > end) {
                return false;
            }
        }

        match self.query.as_deref() {
            Some(query) => {
                conversation.name.contains(query)
                    || conversation
                        .description
                        .as_deref()
                        .is_some_and(|d| d.contains(query))
            }
            None => true,
        }
    }

    pub fn apply<'a>(&self, conversations: &'a [Conversation]) -> Vec<&'a Conversation> {
        conversations.iter().filter(|c| self.matches(c)).collect()
    }

    pub fn summarize(&self, conversations: &[Conversation]) -> FilterSummary {
        FilterSummary {
            shown: conversations.iter().filter(|c| self.matches(c)).count(),
            total: conversations.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSummary {
    pub shown: usize,
    pub total: usize,
}

impl FilterSummary {
    pub fn is_filtered(&self) -> bool {
        self.shown != self.total
    }
}

impl fmt::Display for FilterSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Showing {} of {} conversations", self.shown, self.total)
    }
}

#[cfg(test)]
#[path = "tests/conversation_filter_tests.rs"]
mod tests;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::FetchError;
use crate::record::{Record, RecordId, CREATED_AT_KEY, ID_KEY};

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub items: Option<Vec<Value>>,
    #[serde(default)]
    pub metadata: Option<PageMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageMetadata {
    #[serde(default, rename = "nextPage")]
    pub next_page: Option<String>,
}

impl Page {
    pub fn next_page(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.next_page.as_deref())
            .filter(|url| !url.is_empty())
    }
}

/// Parses a response body into a [`Page`]. Anything that is not a JSON object with the
/// expected shape counts as malformed.
pub(crate) fn parse_page(body: &str) -> Result<Page, FetchError> {
    Ok(serde_json::from_str(body)?)
}

/// What the retrieval loop learns from a single item before deciding on it.
#[derive(Debug)]
pub(crate) enum Item {
    Observed {
        record: Record,
        id: RecordId,
        created_at: DateTime<Utc>,
    },
    /// A required field is missing or unreadable; the item is skipped.
    Incomplete {
        id: Option<RecordId>,
        missing: &'static str,
    },
}

pub(crate) fn inspect_item(value: Value) -> Item {
    let Some(record) = Record::from_value(value) else {
        return Item::Incomplete {
            id: None,
            missing: "object",
        };
    };
    let Some(id) = record.id() else {
        return Item::Incomplete {
            id: None,
            missing: ID_KEY,
        };
    };
    let Some(created_at) = record.created_at() else {
        return Item::Incomplete {
            id: Some(id),
            missing: CREATED_AT_KEY,
        };
    };
    Item::Observed {
        record,
        id,
        created_at,
    }
}

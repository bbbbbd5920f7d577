//! Which channels a query listens on and how its events are processed.

use crate::bus::ChannelNames;
use crate::query::{is_id_only, selector_ids, QueryOptions, SortOrder};
use crate::types::{DocId, ID_FIELD};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Collection-wide channel; every event is run through the matcher.
    Broadcast,
    /// Per-document channels of the listed ids.
    Dedicated(Vec<DocId>),
    /// Bounded ordered window, re-queried when ranking may change.
    LimitSort,
}

impl Strategy {
    /// Precedence: explicit broadcast, then limit, then id constraint.
    pub fn select(selector: &Value, options: &QueryOptions) -> Self {
        if options.broadcast {
            return Strategy::Broadcast;
        }
        if options.limit.is_some() {
            return Strategy::LimitSort;
        }
        match selector_ids(selector) {
            Some(ids) => Strategy::Dedicated(ids),
            None => Strategy::Broadcast,
        }
    }

    /// Options as the result set runs them: windowed queries always sort.
    pub fn normalize_options(&self, mut options: QueryOptions) -> QueryOptions {
        if *self == Strategy::LimitSort && options.sort.as_ref().map_or(true, Vec::is_empty) {
            options = options.sort_by(ID_FIELD, SortOrder::Asc);
        }
        options
    }

    /// Bus channels a result set with this strategy subscribes to.
    pub fn channels(&self, collection: &str, options: &QueryOptions, names: &ChannelNames) -> Vec<String> {
        match self {
            Strategy::Dedicated(ids) => ids.iter().map(|id| names.dedicated(collection, id)).collect(),
            _ => match &options.channels {
                Some(custom) => custom.iter().map(|c| names.custom(c)).collect(),
                None => vec![names.collection(collection)],
            },
        }
    }

    /// Whether events must be matched against the selector.
    pub fn needs_matcher(&self, selector: &Value) -> bool {
        !matches!(self, Strategy::Dedicated(_)) || !is_id_only(selector)
    }
}

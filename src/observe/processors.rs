//! Per-strategy handling of routed events.

use super::result_set::ObservableResultSet;
use super::strategy::Strategy;
use super::Delivery;
use crate::error::Result;
use crate::events::EventKind;
use crate::query::selector_fields;
use crate::types::{DocId, Document};

/// An event after the router merged it into the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEvent {
    pub kind: EventKind,
    pub id: DocId,
    /// Full current document; `None` for removals.
    pub doc: Option<Document>,
    /// Changed top-level fields. `None` means every field.
    pub fields: Option<Vec<String>>,
}

impl ResolvedEvent {
    pub fn removal(kind: EventKind, id: DocId) -> Self {
        Self {
            kind,
            id,
            doc: None,
            fields: None,
        }
    }
}

/// Apply one routed event to a result set according to its strategy.
pub fn process(
    strategy: &Strategy,
    rs: &ObservableResultSet,
    event: &ResolvedEvent,
    mode: Delivery,
) -> Result<()> {
    match strategy {
        Strategy::LimitSort => process_windowed(rs, event, mode),
        _ => process_incremental(strategy, rs, event, mode),
    }
}

fn process_incremental(
    strategy: &Strategy,
    rs: &ObservableResultSet,
    event: &ResolvedEvent,
    mode: Delivery,
) -> Result<()> {
    let eligible = |doc: &Document| -> Result<bool> {
        if strategy.needs_matcher(rs.selector()) {
            rs.is_eligible(doc)
        } else {
            Ok(true)
        }
    };

    match (event.kind, &event.doc) {
        (EventKind::Insert, Some(doc)) => {
            if !rs.contains(&event.id) && eligible(doc)? {
                rs.add(doc.clone(), mode)?;
            }
        }
        (EventKind::Update | EventKind::ForcedUpdate, Some(doc)) => {
            let tracked = rs.contains(&event.id);
            match (tracked, eligible(doc)?) {
                (true, true) => rs.change(doc.clone(), event.fields.as_deref(), mode)?,
                (true, false) => rs.remove(&event.id, mode)?,
                (false, true) => rs.add(doc.clone(), mode)?,
                (false, false) => {}
            }
        }
        (EventKind::Remove | EventKind::ForcedRemove, _) => rs.remove(&event.id, mode)?,
        (kind, None) => {
            tracing::warn!(id = %event.id, ?kind, "event without document ignored");
        }
    }
    Ok(())
}

fn process_windowed(rs: &ObservableResultSet, event: &ResolvedEvent, mode: Delivery) -> Result<()> {
    let fields = event.fields.as_deref();
    match (event.kind, &event.doc) {
        (EventKind::Insert, Some(doc)) => {
            if !rs.is_eligible(doc)? {
                return Ok(());
            }
            let no_skip = rs.options().skip.unwrap_or(0) == 0;
            if !rs.is_limit_reached() && no_skip {
                rs.add(doc.clone(), mode)
            } else {
                rs.requery(Some(doc), Some(event.kind), fields, mode)
            }
        }
        (EventKind::Update, Some(doc)) => {
            let tracked = rs.contains(&event.id);
            let eligible = rs.is_eligible(doc)?;
            if tracked && eligible && !affects_ranking(rs, fields) {
                rs.change(doc.clone(), fields, mode)
            } else if tracked || eligible {
                rs.requery(Some(doc), Some(event.kind), fields, mode)
            } else {
                Ok(())
            }
        }
        (EventKind::ForcedUpdate, Some(doc)) => {
            rs.requery(Some(doc), Some(event.kind), fields, mode)
        }
        (EventKind::Remove, _) => {
            if rs.contains(&event.id) {
                rs.requery(None, Some(event.kind), None, mode)
            } else {
                Ok(())
            }
        }
        (EventKind::ForcedRemove, _) => rs.requery(None, Some(event.kind), None, mode),
        (kind, None) => {
            tracing::warn!(id = %event.id, ?kind, "event without document ignored");
            Ok(())
        }
    }
}

/// Whether changed fields may move a document within or out of the window.
fn affects_ranking(rs: &ObservableResultSet, fields: Option<&[String]>) -> bool {
    let Some(fields) = fields else {
        return true;
    };
    let sort = rs.options().sort_fields();
    let selector = selector_fields(rs.selector());
    fields
        .iter()
        .any(|f| sort.contains(f) || selector.contains(f))
}

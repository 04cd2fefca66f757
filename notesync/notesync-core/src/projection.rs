//! Read models computed from durable rows: the rows behind each view slot.

use crate::model::{Collection, EntityId, Group, Item};
use crate::view::{Page, SortOrder, ViewPage, ViewQuery};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FolderSummary {
    #[serde(flatten)]
    pub collection: Collection,
    pub notebook_count: usize,
    pub note_count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotebookSummary {
    #[serde(flatten)]
    pub group: Group,
    pub note_count: usize,
}

fn note_counts<'a>(items: impl IntoIterator<Item = &'a Item>) -> HashMap<EntityId, usize> {
    let mut counts = HashMap::new();
    for item in items {
        *counts.entry(item.group_id).or_insert(0) += 1;
    }
    counts
}

fn matches_search(haystacks: &[&str], search: Option<&str>) -> bool {
    match search.map(str::trim).filter(|s| !s.is_empty()) {
        None => true,
        Some(needle) => {
            let needle = needle.to_lowercase();
            haystacks.iter().any(|h| h.to_lowercase().contains(&needle))
        }
    }
}

/// Collections by name, each with its (non-archived unless asked) group
/// count and item count.
pub fn folder_summaries(
    collections: &[Collection],
    groups: &[Group],
    items: &[Item],
    query: &ViewQuery,
) -> Vec<FolderSummary> {
    let counts = note_counts(items);
    let mut rows: Vec<FolderSummary> = collections
        .iter()
        .filter(|c| matches_search(&[&c.name], query.search.as_deref()))
        .map(|c| {
            let visible: Vec<&Group> = groups
                .iter()
                .filter(|g| g.collection_id == c.id && (query.include_archived || !g.archived))
                .collect();
            FolderSummary {
                collection: c.clone(),
                notebook_count: visible.len(),
                note_count: visible
                    .iter()
                    .map(|g| counts.get(&g.id).copied().unwrap_or(0))
                    .sum(),
            }
        })
        .collect();
    rows.sort_by(|a, b| {
        a.collection
            .name
            .to_lowercase()
            .cmp(&b.collection.name.to_lowercase())
            .then(a.collection.created_at.cmp(&b.collection.created_at))
    });
    rows
}

/// Groups of one collection in display order with their item counts.
pub fn notebook_summaries(
    collection: EntityId,
    groups: &[Group],
    items: &[Item],
    query: &ViewQuery,
) -> Vec<NotebookSummary> {
    let counts = note_counts(items);
    let mut rows: Vec<NotebookSummary> = groups
        .iter()
        .filter(|g| g.collection_id == collection)
        .filter(|g| query.include_archived || !g.archived)
        .filter(|g| matches_search(&[&g.name], query.search.as_deref()))
        .map(|g| NotebookSummary {
            group: g.clone(),
            note_count: counts.get(&g.id).copied().unwrap_or(0),
        })
        .collect();
    rows.sort_by(|a, b| {
        a.group
            .sort_order
            .cmp(&b.group.sort_order)
            .then_with(|| a.group.name.cmp(&b.group.name))
    });
    rows
}

/// Items of one group filtered by the search text and sorted; manual order
/// unless the query says otherwise.
pub fn notebook_notes(group: EntityId, items: &[Item], query: &ViewQuery) -> Vec<Item> {
    let mut rows: Vec<Item> = items
        .iter()
        .filter(|i| i.group_id == group)
        .filter(|i| matches_search(&[&i.title, &i.content], query.search.as_deref()))
        .cloned()
        .collect();
    sort_items(&mut rows, query.sort.unwrap_or(SortOrder::Manual));
    rows
}

pub fn sort_items(items: &mut [Item], sort: SortOrder) {
    match sort {
        SortOrder::Recent => items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at)),
        SortOrder::Oldest => items.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        SortOrder::Title => items.sort_by(|a, b| {
            a.title
                .to_lowercase()
                .cmp(&b.title.to_lowercase())
                .then(a.created_at.cmp(&b.created_at))
        }),
        SortOrder::Manual => items.sort_by(|a, b| {
            a.position
                .total_cmp(&b.position)
                .then(a.created_at.cmp(&b.created_at))
        }),
    }
}

/// Cut one page out of the full row list.
pub fn paginate<T: Serialize>(rows: Vec<T>, page: &Page) -> ViewPage {
    let total = rows.len();
    let limit = page.limit.unwrap_or(usize::MAX);
    let rows = rows
        .into_iter()
        .skip(page.offset)
        .take(limit)
        .filter_map(|row| serde_json::to_value(row).ok())
        .collect();
    ViewPage { rows, total }
}

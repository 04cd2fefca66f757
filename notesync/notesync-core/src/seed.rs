//! First-login population of a user's tree from a JSON template.

use crate::backend::{Backend, Filter};
use crate::error::SyncResult;
use crate::model::EntityKind;
use crate::mutation::MutationManager;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

const DEFAULT_TEMPLATE: &str = include_str!("../templates/seed.json");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeedTemplate {
    pub collections: Vec<SeedCollection>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeedCollection {
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub groups: Vec<SeedGroup>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeedGroup {
    pub name: String,
    #[serde(default)]
    pub items: Vec<SeedItem>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeedItem {
    pub title: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeedCounts {
    pub collections: usize,
    pub groups: usize,
    pub items: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeedOutcome {
    /// The user already owns a collection.
    Skipped,
    Seeded(SeedCounts),
}

impl SeedTemplate {
    /// The template shipped with the crate.
    pub fn builtin() -> Result<Self> {
        serde_json::from_str(DEFAULT_TEMPLATE).context("built-in seed template")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading seed template {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing seed template {}", path.display()))
    }

    /// `path` when given, the built-in template otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::builtin(),
        }
    }

    pub fn counts(&self) -> SeedCounts {
        let groups = self.collections.iter().flat_map(|c| &c.groups);
        SeedCounts {
            collections: self.collections.len(),
            groups: groups.clone().count(),
            items: groups.map(|g| g.items.len()).sum(),
        }
    }
}

/// Populate the user's tree from `template` unless they already own a
/// collection. Every entity goes through the optimistic create path, so a
/// failure stops the run with the entities created so far left in place.
pub async fn seed_if_empty(
    backend: &dyn Backend,
    mutations: &MutationManager,
    template: &SeedTemplate,
) -> SyncResult<SeedOutcome> {
    let user = mutations.user().id.clone();
    let owned = backend
        .list(EntityKind::Collection, &Filter::all().eq("owner_id", &user))
        .await?;
    if !owned.is_empty() {
        debug!(%user, owned = owned.len(), "seed skipped");
        return Ok(SeedOutcome::Skipped);
    }

    let mut counts = SeedCounts::default();
    for collection in &template.collections {
        let created = mutations
            .create_collection(&collection.name, collection.color.as_deref())
            .await?;
        counts.collections += 1;
        for group in &collection.groups {
            let parent = mutations.create_group(created.id(), &group.name).await?;
            counts.groups += 1;
            for item in &group.items {
                mutations
                    .create_item(parent.id(), &item.title, &item.content)
                    .await?;
                counts.items += 1;
            }
        }
    }
    info!(
        %user,
        collections = counts.collections,
        groups = counts.groups,
        items = counts.items,
        "seeded new user"
    );
    Ok(SeedOutcome::Seeded(counts))
}

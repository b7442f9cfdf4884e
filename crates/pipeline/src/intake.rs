use std::collections::HashSet;

use quasar_social::Mention;
use quasar_storage::{StoreError, TipStore};

/// Drop mentions that already carry a processed marker, and repeats of the
/// same id inside one fetch. Read-only; order is preserved.
pub async fn filter_new(
    store: &dyn TipStore,
    mentions: Vec<Mention>,
) -> Result<Vec<Mention>, StoreError> {
    let ids: Vec<String> = mentions.iter().map(|m| m.id.clone()).collect();
    let processed = store.processed_among(&ids).await?;

    let mut seen = HashSet::new();
    Ok(mentions
        .into_iter()
        .filter(|m| !processed.contains(&m.id) && seen.insert(m.id.clone()))
        .collect())
}

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::source::Source;
use crate::types::{Chapter, SortOrder};

/// Upper bound on listing requests for one catalog.
pub const DEFAULT_MAX_ROUNDS: usize = 100;
/// Expected size assumed when a provider does not report a total.
pub const DEFAULT_FALLBACK_TOTAL: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub max_rounds: usize,
    pub fallback_total: usize,
    /// Language kept in the catalog; `None` keeps every language.
    pub language: Option<String>,
    pub order: Option<SortOrder>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            fallback_total: DEFAULT_FALLBACK_TOTAL,
            language: Some("en".to_string()),
            order: None,
        }
    }
}

/// Why aggregation stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogOutcome {
    /// A round produced no chapter that had not been seen.
    Converged,
    /// The provider's reported total was reached.
    TotalReached,
    /// The round cap was hit first.
    RoundLimit,
    /// A listing request failed; the catalog holds what arrived before it.
    Partial(SourceError),
}

#[derive(Debug, Clone)]
pub struct Catalog {
    pub chapters: Vec<Chapter>,
    pub outcome: CatalogOutcome,
    pub rounds: usize,
}

impl Catalog {
    pub fn is_partial(&self) -> bool {
        matches!(self.outcome, CatalogOutcome::Partial(_))
    }
}

/// Pull a provider's paginated chapter listing until it converges on a deduplicated set.
///
/// Requests are strictly sequential: the offset of each round is the number of listing rows
/// consumed so far. Chapters keep the order in which they arrived.
pub async fn aggregate_chapters(source: &dyn Source, manga_id: &str, config: &CatalogConfig) -> Catalog {
    let mut chapters: Vec<Chapter> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut expected_total: Option<usize> = None;
    let mut offset = 0usize;

    for round in 1..=config.max_rounds {
        let page = match source.get_chapters(manga_id, Some(offset), config.order).await {
            Ok(page) => page,
            Err(e) => {
                warn!(source = source.id(), manga_id, round, error = %e, "chapter listing failed; keeping partial catalog");
                return Catalog { chapters, outcome: CatalogOutcome::Partial(e), rounds: round };
            }
        };
        offset += page.data.len();
        if expected_total.is_none() && !page.data.is_empty() {
            expected_total = Some(page.total.unwrap_or(config.fallback_total));
        }

        let mut added = 0usize;
        for chapter in page.data {
            if !seen.insert(chapter.id.clone()) {
                continue;
            }
            added += 1;
            if language_matches(config.language.as_deref(), chapter.lang.as_deref()) {
                chapters.push(chapter);
            }
        }
        debug!(source = source.id(), manga_id, round, added, seen = seen.len(), "chapter round");

        if added == 0 {
            return Catalog { chapters, outcome: CatalogOutcome::Converged, rounds: round };
        }
        if matches!(expected_total, Some(total) if seen.len() >= total) {
            return Catalog { chapters, outcome: CatalogOutcome::TotalReached, rounds: round };
        }
    }

    warn!(source = source.id(), manga_id, rounds = config.max_rounds, "chapter listing never converged");
    Catalog { chapters, outcome: CatalogOutcome::RoundLimit, rounds: config.max_rounds }
}

fn language_matches(wanted: Option<&str>, lang: Option<&str>) -> bool {
    let (Some(wanted), Some(lang)) = (wanted, lang) else { return true };
    let lang = lang.to_ascii_lowercase();
    let wanted = wanted.to_ascii_lowercase();
    lang == wanted || lang.starts_with(&format!("{wanted}-"))
}

/// Order by volume, then chapter number. Chapters without a volume go last.
pub fn sort_chapters(chapters: &mut [Chapter]) {
    chapters.sort_by(|a, b| {
        let va = a.volume.unwrap_or(f64::INFINITY);
        let vb = b.volume.unwrap_or(f64::INFINITY);
        match va.total_cmp(&vb) {
            Ordering::Equal => a.chapter.total_cmp(&b.chapter),
            o => o,
        }
    });
}

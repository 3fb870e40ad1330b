use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::AppError;
use crate::metadata::FileSource;

/// Label → weight lookup; labels missing from the table weigh 0
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorityTable {
    weights: HashMap<String, i64>,
}

impl PriorityTable {
    pub fn new<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, i64)>,
    {
        Self {
            weights: entries.into_iter().collect(),
        }
    }

    pub fn weight(&self, label: &str) -> i64 {
        self.weights.get(label).copied().unwrap_or(0)
    }
}

/// How to choose among sources that share the top-ranked label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TieBreak {
    /// Uniform pick, spreads load over mirrors of the same encoding
    Random,
    First,
}

/// Sorts sources by descending weight. The sort is stable so equal weights keep server order.
pub fn rank(sources: &mut [FileSource], table: &PriorityTable) {
    sources.sort_by(|a, b| table.weight(&b.label).cmp(&table.weight(&a.label)));
}

/// Picks the download source from an already ranked list.
///
/// The winning label is always the label of the first ranked source, so it only
/// depends on the table and the server order. `tie_break` decides which of the
/// sources carrying that label is returned.
pub fn select<'a, R>(
    ranked: &'a [FileSource],
    tie_break: TieBreak,
    rng: &mut R,
) -> Option<&'a FileSource>
where
    R: Rng + ?Sized,
{
    let top_label = &ranked.first()?.label;
    let candidates: Vec<&FileSource> = ranked
        .iter()
        .filter(|source| &source.label == top_label)
        .collect();

    match tie_break {
        TieBreak::First => candidates.first().copied(),
        TieBreak::Random => candidates.get(rng.gen_range(0..candidates.len())).copied(),
    }
}

/// Returns a non-fatal warning when the chosen quality is not the preferred one
pub fn check_preferred(id: &str, chosen: &str, preferred: &str) -> Option<AppError> {
    if chosen == preferred {
        return None;
    }
    Some(AppError::QualityWarning {
        id: id.to_string(),
        actual: chosen.to_string(),
        preferred: preferred.to_string(),
    })
}

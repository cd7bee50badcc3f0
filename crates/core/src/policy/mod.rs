use std::sync::LazyLock;

use serde::Serialize;

use crate::EditKind;

static POLICY: LazyLock<GenrePolicy> = LazyLock::new(GenrePolicy::builtin);

/// Genre to edit catalog routing. Built once per process and never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct GenrePolicy {
    rules: Vec<GenreRule>,
    fallback: Vec<EditKind>,
}

/// One row of the table: every spelling in `genres` produces `edits`.
#[derive(Debug, Clone, Serialize)]
pub struct GenreRule {
    pub genres: Vec<&'static str>,
    pub edits: Vec<EditKind>,
}

impl GenrePolicy {
    /// The process-wide table.
    pub fn global() -> &'static GenrePolicy {
        &POLICY
    }

    fn builtin() -> Self {
        Self {
            rules: vec![GenreRule {
                // Club genres where DJs only want the original arrangement.
                genres: vec!["House", "Electro House", "Electro-House", "Dance"],
                edits: vec![EditKind::Main],
            }],
            fallback: EditKind::FULL_CATALOG.to_vec(),
        }
    }

    /// Edits for `genre`, ignoring case, spacing and punctuation. Unmatched
    /// genres get the full catalog.
    pub fn edits_for(&self, genre: &str) -> &[EditKind] {
        let wanted = normalise(genre);
        self.rules
            .iter()
            .find(|rule| rule.genres.iter().any(|name| normalise(name) == wanted))
            .map(|rule| rule.edits.as_slice())
            .unwrap_or(&self.fallback)
    }

    /// Edits a job should produce. An explicit request replaces the genre
    /// lookup; duplicates are dropped and catalog order is kept.
    pub fn resolve(&self, genre: &str, requested: &[EditKind]) -> Vec<EditKind> {
        if requested.is_empty() {
            return self.edits_for(genre).to_vec();
        }
        let mut edits = requested.to_vec();
        edits.sort();
        edits.dedup();
        edits
    }

    pub fn rules(&self) -> &[GenreRule] {
        &self.rules
    }

    pub fn fallback(&self) -> &[EditKind] {
        &self.fallback
    }
}

fn normalise(genre: &str) -> String {
    genre
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

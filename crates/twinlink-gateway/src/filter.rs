use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use crate::criterion::Criterion;
use crate::error::{Error, ErrorKind, Result};

/// A filter language parser.
///
/// A parser turns a query written in one of its languages into a
/// [`Criterion`].
pub trait FilterParser: Send + Sync {
    /// Returns the names of the supported languages.
    fn languages(&self) -> &[&str];

    /// Parses a query.
    ///
    /// # Errors
    ///
    /// Returns an error when the query is not valid in the given language.
    fn parse(&self, language: &str, query: &str) -> Result<Criterion>;
}

/// Identifier of a registered [`FilterParser`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParserId(u64);

struct Entry {
    id: ParserId,
    rank: i32,
    parser: Arc<dyn FilterParser>,
}

/// Registry of the available filter languages.
///
/// When several parsers declare the same language, the one with the lowest
/// rank is used, the oldest one on equal ranks.
#[derive(Default)]
pub struct FilterRegistry {
    entries: RwLock<Vec<Entry>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("languages", &self.languages())
            .finish()
    }
}

impl FilterRegistry {
    /// Creates an empty [`FilterRegistry`].
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a parser with the given rank.
    pub fn register<P>(&self, parser: P, rank: i32) -> ParserId
    where
        P: FilterParser + 'static,
    {
        let id = ParserId(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(
            "Registering a filter parser for {:?} with rank {rank}",
            parser.languages()
        );

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.push(Entry {
            id,
            rank,
            parser: Arc::new(parser),
        });
        entries.sort_by_key(|entry| (entry.rank, entry.id));
        id
    }

    /// Unregisters a parser.
    ///
    /// Returns `false` when the parser is unknown.
    pub fn unregister(&self, id: ParserId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        before != entries.len()
    }

    /// Returns the supported languages, without duplicates.
    #[must_use]
    pub fn languages(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut languages = Vec::new();
        for language in entries
            .iter()
            .flat_map(|entry| entry.parser.languages().iter().copied())
        {
            if !languages.iter().any(|known: &String| known == language) {
                languages.push(language.to_owned());
            }
        }
        languages
    }

    /// Parses a query with the best-ranked parser of a language.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::UnsupportedLanguage`] when no parser handles the
    /// language and [`ErrorKind::FilterParse`] when the query is invalid.
    pub fn parse_filter(&self, language: &str, query: &str) -> Result<Criterion> {
        // The lock is released before parsing.
        let parser = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .find(|entry| entry.parser.languages().contains(&language))
                .map(|entry| Arc::clone(&entry.parser))
        };

        let Some(parser) = parser else {
            return Err(Error::new(
                ErrorKind::UnsupportedLanguage,
                format!("No parser for the `{language}` filter language"),
            ));
        };

        parser.parse(language, query).map_err(|e| {
            debug!("Invalid `{language}` filter `{query}`: {e}");
            if e.kind() == ErrorKind::FilterParse {
                e
            } else {
                Error::new(ErrorKind::FilterParse, e.description().to_owned())
            }
        })
    }
}

use super::{
    BookMetadata, EmbeddedProvider, FilenameProvider, GoogleBooksProvider, LookupCriteria,
    MetadataProvider, OpenLibraryProvider,
};
use crate::config::MetadataConfig;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// Result of one pass over the providers.
#[derive(Debug, Clone, Default)]
pub struct WaterfallOutcome {
    /// Merged metadata, highest-priority value per field.
    pub metadata: BookMetadata,
    /// Providers that contributed at least one field, in order.
    pub contributors: Vec<&'static str>,
    /// Providers that errored or timed out.
    pub failed: Vec<&'static str>,
}

/// Ordered chain of metadata providers.
pub struct Waterfall {
    providers: Vec<Arc<dyn MetadataProvider>>,
    timeout: Duration,
}

impl Waterfall {
    /// Chain the given providers, highest priority first.
    pub fn new(providers: Vec<Arc<dyn MetadataProvider>>, timeout: Duration) -> Self {
        Self { providers, timeout }
    }

    /// Standard chain: embedded, Open Library, Google Books, filename.
    ///
    /// The two remote providers are left out when external fetching is disabled.
    pub fn from_config(config: &MetadataConfig) -> Result<Self> {
        let mut providers: Vec<Arc<dyn MetadataProvider>> = vec![Arc::new(EmbeddedProvider)];
        if config.fetch_external {
            providers.push(Arc::new(OpenLibraryProvider::new(config)?));
            providers.push(Arc::new(GoogleBooksProvider::new(config)?));
        }
        providers.push(Arc::new(FilenameProvider));
        Ok(Self::new(providers, config.timeout()))
    }

    /// Provider names in query order.
    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Query providers in order, merging field by field.
    ///
    /// A field keeps the first value any provider supplies. Results also refine the
    /// criteria handed to later providers. Stops once title, author and cover are known.
    /// Provider errors and timeouts are logged and skipped; this never fails.
    pub async fn run(&self, mut criteria: LookupCriteria) -> WaterfallOutcome {
        let mut outcome = WaterfallOutcome::default();

        for provider in &self.providers {
            if outcome.metadata.is_complete() {
                tracing::debug!(provider = provider.name(), "Metadata complete, skipping");
                break;
            }

            let found = match tokio::time::timeout(self.timeout, provider.lookup(&criteria)).await
            {
                Ok(Ok(Some(found))) => found,
                Ok(Ok(None)) => {
                    tracing::debug!(provider = provider.name(), "No metadata found");
                    continue;
                }
                Ok(Err(e)) => {
                    tracing::warn!(provider = provider.name(), error = %e, "Metadata lookup failed");
                    outcome.failed.push(provider.name());
                    continue;
                }
                Err(_) => {
                    tracing::warn!(
                        provider = provider.name(),
                        timeout_secs = self.timeout.as_secs(),
                        "Metadata lookup timed out"
                    );
                    outcome.failed.push(provider.name());
                    continue;
                }
            };

            let filled = outcome.metadata.fill_from(&found);
            criteria.refine(&found);
            if !filled.is_empty() {
                tracing::debug!(
                    provider = provider.name(),
                    fields = ?filled,
                    "Metadata fields filled"
                );
                outcome.contributors.push(provider.name());
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BookFormat;
    use crate::error::AppError;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        result: Option<BookMetadata>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(name: &'static str, result: Option<BookMetadata>) -> Arc<Self> {
            Arc::new(Self {
                name,
                result,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MetadataProvider for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn lookup(&self, _criteria: &LookupCriteria) -> Result<Option<BookMetadata>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result.clone())
        }
    }

    struct Failing;

    #[async_trait]
    impl MetadataProvider for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn lookup(&self, _criteria: &LookupCriteria) -> Result<Option<BookMetadata>> {
            Err(AppError::Internal("rate limited".into()))
        }
    }

    struct Slow;

    #[async_trait]
    impl MetadataProvider for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn lookup(&self, _criteria: &LookupCriteria) -> Result<Option<BookMetadata>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
    }

    struct IsbnEcho;

    #[async_trait]
    impl MetadataProvider for IsbnEcho {
        fn name(&self) -> &'static str {
            "isbn-echo"
        }

        async fn lookup(&self, criteria: &LookupCriteria) -> Result<Option<BookMetadata>> {
            Ok(criteria.isbn.as_ref().map(|isbn| BookMetadata {
                description: Some(format!("looked up {}", isbn)),
                ..Default::default()
            }))
        }
    }

    fn criteria() -> LookupCriteria {
        LookupCriteria {
            isbn: None,
            title: None,
            author: None,
            path: PathBuf::from("/books/Unknown - Untitled.epub"),
            format: BookFormat::Epub,
        }
    }

    fn meta(title: Option<&str>, author: Option<&str>, cover: Option<&str>) -> BookMetadata {
        BookMetadata {
            title: title.map(String::from),
            author: author.map(String::from),
            cover_ref: cover.map(String::from),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn earlier_provider_wins_each_field() {
        let a = Fixed::new("a", Some(meta(Some("Title A"), None, None)));
        let b = Fixed::new("b", Some(meta(Some("Title B"), None, Some("http://b/cover.jpg"))));
        let waterfall = Waterfall::new(vec![a, b], Duration::from_secs(5));

        let outcome = waterfall.run(criteria()).await;
        assert_eq!(outcome.metadata.title.as_deref(), Some("Title A"));
        assert_eq!(outcome.metadata.cover_ref.as_deref(), Some("http://b/cover.jpg"));
        assert_eq!(outcome.contributors, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn stops_once_complete() {
        let a = Fixed::new("a", Some(meta(Some("T"), Some("A"), Some("http://c"))));
        let b = Fixed::new("b", Some(meta(Some("Other"), None, None)));
        let waterfall = Waterfall::new(vec![a.clone(), b.clone()], Duration::from_secs(5));

        let outcome = waterfall.run(criteria()).await;
        assert_eq!(outcome.metadata.title.as_deref(), Some("T"));
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failures_and_timeouts_fall_through() {
        let waterfall = Waterfall::new(
            vec![Arc::new(Failing), Arc::new(Slow), Arc::new(FilenameProvider)],
            Duration::from_millis(50),
        );

        let outcome = waterfall.run(criteria()).await;
        assert_eq!(outcome.failed, vec!["failing", "slow"]);
        assert_eq!(outcome.metadata.title.as_deref(), Some("Untitled"));
        assert_eq!(outcome.metadata.author.as_deref(), Some("Unknown"));
    }

    #[tokio::test]
    async fn earlier_results_refine_later_criteria() {
        let embedded = Fixed::new(
            "embedded",
            Some(BookMetadata {
                isbn: Some("9780316246620".into()),
                ..Default::default()
            }),
        );
        let waterfall = Waterfall::new(vec![embedded, Arc::new(IsbnEcho)], Duration::from_secs(5));

        let outcome = waterfall.run(criteria()).await;
        assert_eq!(
            outcome.metadata.description.as_deref(),
            Some("looked up 9780316246620")
        );
    }

    #[test]
    fn disabled_external_fetch_keeps_local_providers() {
        let config = MetadataConfig {
            fetch_external: false,
            ..Default::default()
        };
        let waterfall = Waterfall::from_config(&config).unwrap();
        assert_eq!(waterfall.provider_names(), vec!["embedded", "filename"]);
    }
}

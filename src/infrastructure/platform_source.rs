use std::collections::HashMap;

use async_trait::async_trait;

use crate::application::{AppError, AppResult, SourceAdapter};
use crate::domain::{Listing, Platform, SortOrder};

/// Routes each fetch to the adapter registered for its platform.
#[derive(Default)]
pub struct PlatformSource {
    adapters: HashMap<Platform, Box<dyn SourceAdapter>>,
}

impl PlatformSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, platform: Platform, adapter: Box<dyn SourceAdapter>) -> Self {
        self.adapters.insert(platform, adapter);
        self
    }
}

#[async_trait]
impl SourceAdapter for PlatformSource {
    async fn fetch(&self, platform: Platform, query: &str, sort: SortOrder) -> AppResult<Vec<Listing>> {
        match self.adapters.get(&platform) {
            Some(adapter) => adapter.fetch(platform, query, sort).await,
            None => Err(AppError::Fetch(format!("no source configured for {platform}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::fake_source::FakeSource;

    #[tokio::test]
    async fn routes_by_platform() {
        let yahoo = FakeSource::new();
        yahoo.set_listings(Platform::Yahoo, "seiko", vec![FakeSource::listing("y1", 100.0)]);
        let source = PlatformSource::new().with(Platform::Yahoo, Box::new(yahoo.clone()));

        let got = source
            .fetch(Platform::Yahoo, "seiko", SortOrder::Newest)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(yahoo.calls(), 1);

        let err = source
            .fetch(Platform::Mercari, "seiko", SortOrder::Newest)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Fetch(_)));
    }
}

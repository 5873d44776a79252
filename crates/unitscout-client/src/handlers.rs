use std::sync::Arc;

use unitscout_core::{AppError, Discoverer, ScrapeFailure, ScrapeFailureKind, UnitScraper};

use crate::browser::BrowserSession;
use crate::page::{detect_block_page, extract_codes};
use crate::sink::{PageSink, UnitPage};
use crate::site::SiteRegistry;

/// Lists a university's unit codes from its rendered catalogue page.
#[derive(Clone)]
pub struct BrowserDiscoverer {
    sites: Arc<SiteRegistry>,
}

impl BrowserDiscoverer {
    pub fn new(sites: Arc<SiteRegistry>) -> Self {
        Self { sites }
    }
}

impl Discoverer<BrowserSession> for BrowserDiscoverer {
    async fn discover(
        &self,
        university_id: &str,
        session: &BrowserSession,
    ) -> Result<Vec<String>, AppError> {
        let profile = self.sites.get(university_id)?;
        let url = profile.catalogue_url()?;
        let timeout = profile.page_timeout();

        let page = session
            .render(&url, &profile.ready_selector, timeout)
            .await
            .map_err(|f| into_app_error(f, timeout.as_secs()))?;
        if let Some(blocked) = detect_block_page(&page.title, &page.html) {
            return Err(AppError::RateLimited(blocked.message));
        }

        let codes = extract_codes(&page.html, &profile.code_selector)?;
        if codes.is_empty() {
            tracing::warn!(%university_id, %url, "Catalogue page listed no unit codes");
        } else {
            tracing::info!(%university_id, codes = codes.len(), "Catalogue discovered");
        }
        Ok(codes)
    }
}

/// Renders one unit page and hands it to a [`PageSink`].
#[derive(Clone)]
pub struct BrowserScraper<P: PageSink> {
    sites: Arc<SiteRegistry>,
    sink: P,
}

impl<P: PageSink> BrowserScraper<P> {
    pub fn new(sites: Arc<SiteRegistry>, sink: P) -> Self {
        Self { sites, sink }
    }
}

impl<P: PageSink> UnitScraper<BrowserSession> for BrowserScraper<P> {
    async fn scrape_unit(
        &self,
        university_id: &str,
        unit_code: &str,
        session: &BrowserSession,
    ) -> Result<(), ScrapeFailure> {
        let profile = self.sites.get(university_id)?;
        let url = profile.unit_url(unit_code)?;

        let page = session
            .render(&url, &profile.ready_selector, profile.page_timeout())
            .await?;
        if let Some(blocked) = detect_block_page(&page.title, &page.html) {
            return Err(blocked);
        }

        self.sink
            .accept(UnitPage {
                university_id: university_id.to_string(),
                unit_code: unit_code.to_string(),
                url: page.url,
                title: page.title,
                html: page.html,
            })
            .await
            .map_err(ScrapeFailure::from)
    }
}

fn into_app_error(failure: ScrapeFailure, timeout_secs: u64) -> AppError {
    match failure.kind {
        ScrapeFailureKind::RateLimited => AppError::RateLimited(failure.message),
        ScrapeFailureKind::Timeout => AppError::Timeout(timeout_secs),
        ScrapeFailureKind::NavigationFailed => AppError::NavigationFailed(failure.message),
        ScrapeFailureKind::Other => AppError::BrowserError(failure.message),
    }
}

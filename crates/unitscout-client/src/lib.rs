pub mod page;
pub mod sink;
pub mod site;

#[cfg(feature = "browser")]
pub mod browser;
#[cfg(feature = "browser")]
pub mod handlers;

pub use page::{detect_block_page, extract_codes};
pub use sink::{HashLoggingSink, PageSink, UnitPage, compute_hash};
pub use site::{SiteProfile, SiteRegistry};

#[cfg(feature = "browser")]
pub use browser::{BrowserSession, ChromiumLauncher, RenderedPage};
#[cfg(feature = "browser")]
pub use handlers::{BrowserDiscoverer, BrowserScraper};

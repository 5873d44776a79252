/// Smoke-test for the browser session launcher.
///
/// Launches a headless Chromium, renders <https://example.com>, and checks
/// that the page is neither empty nor classified as a block page.
///
/// Run with:
///   cargo run -p unitscout-client --example browser_smoke --features browser
use std::time::Duration;

use unitscout_client::{ChromiumLauncher, detect_block_page};
use unitscout_core::SessionLauncher;
use url::Url;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let launcher = ChromiumLauncher::new();
    println!("Launching headless browser...");
    let session = launcher.launch().await?;

    let url = Url::parse("https://example.com")?;
    println!("Rendering {url} ...");
    let result = session.render(&url, "h1", Duration::from_secs(30)).await;
    launcher.destroy(session).await;

    let page = result?;
    anyhow::ensure!(
        page.title.contains("Example Domain"),
        "unexpected title {:?}",
        page.title
    );
    anyhow::ensure!(
        detect_block_page(&page.title, &page.html).is_none(),
        "example.com classified as a block page"
    );

    println!("OK, got {} bytes of rendered HTML", page.html.len());
    Ok(())
}

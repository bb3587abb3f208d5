use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::network::ClearBrowserCookiesParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use motorsift_core::automation::AutomationScript;
use motorsift_core::error::{AppError, UpstreamErrorKind};
use motorsift_core::models::{Listing, SearchRequest};
use motorsift_core::pool::ResourceManager;

use crate::scrape::{ScrapeSpec, SelectorParser};

/// Sessions are recycled after this many searches.
const DEFAULT_MAX_USES: u32 = 50;

/// Launch a shared headless Chromium.
///
/// Requires a Chromium / Chrome binary reachable via `$PATH`, `CHROME_BIN`,
/// or one of the well-known install locations.
pub async fn launch_browser() -> Result<Arc<Browser>, AppError> {
    let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

    // Snap-packaged Chromium's wrapper rejects standard Chrome CLI flags, so
    // prefer the real binary when one can be found.
    if let Some(bin) = find_chrome_binary() {
        tracing::info!("Using Chrome binary: {}", bin.display());
        builder = builder.chrome_executable(bin);
    }

    let config = builder
        .arg("--headless=new")
        .arg("--disable-gpu")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--no-first-run")
        .build()
        .map_err(|e| AppError::Generic(format!("Browser config error: {e}")))?;

    let (browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|e| AppError::Generic(format!("Failed to launch browser: {e}")))?;

    // The CDP handler must be polled continuously for the connection to work.
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if event.is_err() {
                tracing::warn!("Browser CDP handler error: {event:?}");
                break;
            }
        }
    });

    Ok(Arc::new(browser))
}

fn find_chrome_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    [
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

/// One browser tab checked out of the pool.
pub struct BrowserSession {
    page: Page,
    uses: u32,
}

impl BrowserSession {
    pub fn page(&self) -> &Page {
        &self.page
    }
}

/// Pool hooks for browser tabs: open, scrub between users, close.
#[derive(Clone)]
pub struct BrowserSessionManager {
    browser: Arc<Browser>,
    max_uses: u32,
}

impl BrowserSessionManager {
    pub fn new(browser: Arc<Browser>) -> Self {
        Self {
            browser,
            max_uses: DEFAULT_MAX_USES,
        }
    }

    pub fn with_max_uses(mut self, max_uses: u32) -> Self {
        self.max_uses = max_uses.max(1);
        self
    }
}

impl ResourceManager for BrowserSessionManager {
    type Resource = BrowserSession;

    async fn create(&self) -> Result<BrowserSession, AppError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| AppError::Generic(format!("Failed to open browser tab: {e}")))?;
        Ok(BrowserSession { page, uses: 0 })
    }

    async fn reset(&self, session: &mut BrowserSession) -> Result<(), AppError> {
        if session.uses >= self.max_uses {
            return Err(AppError::Generic(format!(
                "session used {} times, recycling",
                session.uses
            )));
        }
        session
            .page
            .execute(ClearBrowserCookiesParams::default())
            .await
            .map_err(|e| AppError::Generic(format!("Failed to clear cookies: {e}")))?;
        session
            .page
            .goto("about:blank")
            .await
            .map_err(|e| AppError::Generic(format!("Failed to blank tab: {e}")))?;
        Ok(())
    }

    async fn close(&self, session: BrowserSession) {
        if let Err(e) = session.page.close().await {
            tracing::debug!(error = %e, "Closing browser tab failed");
        }
    }
}

/// Automation script that loads a configured search page and reads it with
/// CSS selectors.
pub struct ScrapedSource {
    id: String,
    spec: ScrapeSpec,
    parser: SelectorParser,
    nav_timeout: Duration,
}

impl ScrapedSource {
    pub fn new(id: impl Into<String>, spec: ScrapeSpec, nav_timeout: Duration) -> Result<Self, AppError> {
        let id = id.into();
        let parser = spec.parser(&id)?;
        Ok(Self {
            id,
            spec,
            parser,
            nav_timeout,
        })
    }

    async fn load(&self, page: &Page, url: &str) -> Result<String, AppError> {
        let navigation = async {
            page.goto(url)
                .await
                .map_err(|e| AppError::upstream(&self.id, UpstreamErrorKind::Unknown, format!("navigation failed: {e}")))?;
            page.find_element("body").await.map_err(|e| {
                AppError::upstream(&self.id, UpstreamErrorKind::Parse, format!("page did not render body: {e}"))
            })?;
            page.content()
                .await
                .map_err(|e| AppError::upstream(&self.id, UpstreamErrorKind::Unknown, format!("failed to read page: {e}")))
        };

        tokio::time::timeout(self.nav_timeout, navigation)
            .await
            .map_err(|_| {
                AppError::upstream(
                    &self.id,
                    UpstreamErrorKind::Timeout,
                    format!("page load exceeded {} ms", self.nav_timeout.as_millis()),
                )
            })?
    }
}

impl AutomationScript<BrowserSession> for ScrapedSource {
    async fn search(
        &self,
        session: &mut BrowserSession,
        request: &SearchRequest,
        page: u32,
        _page_size: u32,
    ) -> Result<Vec<Listing>, AppError> {
        session.uses += 1;
        let url = self.spec.search_url_for(request, page)?;
        tracing::debug!(source = %self.id, url = %url, "Loading search page");

        let html = self.load(&session.page, url.as_str()).await?;
        self.parser.parse(&html, &url)
    }

    async fn health_check(&self, session: &mut BrowserSession) -> Result<(), AppError> {
        let url = self.spec.health_url()?;
        self.load(&session.page, url.as_str()).await.map(|_| ())
    }
}

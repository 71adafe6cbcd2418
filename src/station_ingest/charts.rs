// station_ingest - Ingest tools for a Campbell datalogger weather station
//
// Copyright 2024 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use reqwest::header::USER_AGENT;
use reqwest::{Client, StatusCode, Url};
use scraper::{Html, Selector};
use std::error;
use std::fmt;
use std::path::Path;

// The BOM serves an error page to clients that don't look like a browser
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/120.0.0.0 Safari/537.36";

const SYNOPTIC_URL: &str = "https://www.bom.gov.au/australia/charts/synoptic_col.shtml";
const SATELLITE_URL: &str = "https://www.bom.gov.au/australia/satellite/";

#[derive(Debug)]
pub enum ChartError {
    Transport(reqwest::Error),
    Unexpected(StatusCode, Url),
    Io(std::io::Error),
}

impl fmt::Display for ChartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{}", e),
            Self::Unexpected(status, url) => write!(f, "unexpected status {} for {}", status, url),
            Self::Io(e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for ChartError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Which `<img>` entries on a page count as chart images: an extension
/// match (case insensitive) and an optional file name prefix (case
/// sensitive, matching how the BOM names its chart products).
#[derive(Debug, Clone)]
pub struct ImageFilter {
    pub extension: &'static str,
    pub prefix: Option<&'static str>,
}

impl ImageFilter {
    fn matches(&self, file_name: &str) -> bool {
        if !file_name.to_ascii_lowercase().ends_with(self.extension) {
            return false;
        }

        match self.prefix {
            Some(prefix) => file_name.starts_with(prefix),
            None => true,
        }
    }
}

/// Pull the chart image URLs out of one page's HTML, resolving relative
/// `src` attributes against the page URL.
pub fn extract_image_urls(page_url: &Url, html: &str, filter: &ImageFilter) -> Vec<Url> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("img[src]").unwrap();

    let mut urls = Vec::new();
    for element in document.select(&selector) {
        let src = match element.value().attr("src") {
            Some(src) => src,
            None => continue,
        };
        let resolved = match page_url.join(src) {
            Ok(url) => url,
            Err(_) => continue,
        };
        match file_name(&resolved) {
            Some(name) if filter.matches(&name) => urls.push(resolved),
            _ => {}
        }
    }

    urls
}

fn file_name(url: &Url) -> Option<String> {
    url.path_segments()?
        .last()
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_owned())
}

/// Fetch the synoptic chart and satellite pages and download every matching
/// image into `save_dir`, overwriting by file name.
///
/// A page that can't be fetched fails the whole run; a single image that
/// can't be downloaded is logged and skipped. Returns the number of images
/// written.
pub async fn fetch_charts(client: &Client, save_dir: &Path) -> Result<usize, ChartError> {
    tokio::fs::create_dir_all(save_dir).await.map_err(ChartError::Io)?;

    let sources = [
        (
            SYNOPTIC_URL,
            ImageFilter {
                extension: ".png",
                prefix: Some("IDY"),
            },
        ),
        (
            SATELLITE_URL,
            ImageFilter {
                extension: ".jpg",
                prefix: None,
            },
        ),
    ];

    let mut images = Vec::new();
    for (page, filter) in sources {
        let page_url = Url::parse(page).expect("chart page URL is valid");
        let html = fetch_page(client, &page_url).await?;
        images.extend(extract_image_urls(&page_url, &html, &filter));
    }

    if images.is_empty() {
        tracing::warn!("no chart images found");
        return Ok(0);
    }
    tracing::info!(message = "found chart images", count = images.len());

    let mut written = 0;
    for url in images {
        let name = match file_name(&url) {
            Some(name) => name,
            None => continue,
        };
        let target = save_dir.join(name);

        match download_image(client, &url, &target).await {
            Ok(()) => {
                tracing::info!(message = "downloaded chart image", url = %url, path = %target.display());
                written += 1;
            }
            Err(e) => {
                tracing::warn!(message = "failed to download chart image", url = %url, error = %e);
            }
        }
    }

    Ok(written)
}

async fn fetch_page(client: &Client, url: &Url) -> Result<String, ChartError> {
    tracing::debug!(message = "fetching chart page", url = %url);

    let res = client
        .get(url.clone())
        .header(USER_AGENT, BROWSER_USER_AGENT)
        .send()
        .await
        .map_err(ChartError::Transport)?;

    let status = res.status();
    if status != StatusCode::OK {
        return Err(ChartError::Unexpected(status, url.clone()));
    }

    res.text().await.map_err(ChartError::Transport)
}

async fn download_image(client: &Client, url: &Url, target: &Path) -> Result<(), ChartError> {
    let res = client
        .get(url.clone())
        .header(USER_AGENT, BROWSER_USER_AGENT)
        .send()
        .await
        .map_err(ChartError::Transport)?;

    let status = res.status();
    if status != StatusCode::OK {
        return Err(ChartError::Unexpected(status, url.clone()));
    }

    let bytes = res.bytes().await.map_err(ChartError::Transport)?;
    tokio::fs::write(target, &bytes).await.map_err(ChartError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{extract_image_urls, ImageFilter};
    use reqwest::Url;

    const CHARTS_PAGE: &str = r#"
        <html><body>
            <img src="/charts_data/IDY00030.png" alt="MSLP analysis">
            <img src="https://www.bom.gov.au/charts_data/IDY20001.png">
            <img src="/charts_data/legend.png">
            <img src="/banners/logo.gif">
            <img alt="no source">
        </body></html>
    "#;

    const SATELLITE_PAGE: &str = r#"
        <html><body>
            <img src="gms/IDE00135.jpg">
            <img src="/icons/help.PNG">
            <img src="gms/IDE00436.highres.JPG">
        </body></html>
    "#;

    #[test]
    fn test_extract_synoptic_charts() {
        let page_url = Url::parse("https://www.bom.gov.au/australia/charts/synoptic_col.shtml").unwrap();
        let filter = ImageFilter {
            extension: ".png",
            prefix: Some("IDY"),
        };

        let urls = extract_image_urls(&page_url, CHARTS_PAGE, &filter);

        assert_eq!(
            vec![
                "https://www.bom.gov.au/charts_data/IDY00030.png",
                "https://www.bom.gov.au/charts_data/IDY20001.png",
            ],
            urls.iter().map(Url::as_str).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_extract_satellite_images() {
        let page_url = Url::parse("https://www.bom.gov.au/australia/satellite/").unwrap();
        let filter = ImageFilter {
            extension: ".jpg",
            prefix: None,
        };

        let urls = extract_image_urls(&page_url, SATELLITE_PAGE, &filter);

        assert_eq!(
            vec![
                "https://www.bom.gov.au/australia/satellite/gms/IDE00135.jpg",
                "https://www.bom.gov.au/australia/satellite/gms/IDE00436.highres.JPG",
            ],
            urls.iter().map(Url::as_str).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_extract_no_matches() {
        let page_url = Url::parse("https://www.bom.gov.au/australia/satellite/").unwrap();
        let filter = ImageFilter {
            extension: ".jpg",
            prefix: None,
        };

        assert!(extract_image_urls(&page_url, "<html><body></body></html>", &filter).is_empty());
    }
}

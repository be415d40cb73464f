use async_trait::async_trait;
use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use serde_json::json;
use svcdir_core::{CandidateRecord, Job, Metadata};
use tracing::debug;

use crate::contact::{find_email, find_phone};
use crate::{status_error, ExtractError, Extraction, Extractor};

const DEFAULT_ITEM_SELECTOR: &str = "article, li, tr, .service";
const DEFAULT_NAME_SELECTOR: &str = "h1, h2, h3, h4, strong, a";
const MAX_DESCRIPTION_CHARS: usize = 500;

/// Fetches an HTML page and pattern-matches service listings out of it.
#[derive(Debug, Clone)]
pub struct PageExtractor {
    client: reqwest::Client,
}

impl PageExtractor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Extractor for PageExtractor {
    fn kind(&self) -> &'static str {
        "page"
    }

    fn default_confidence(&self) -> Option<f64> {
        Some(0.75)
    }

    async fn extract(&self, job: &Job) -> Result<Extraction, ExtractError> {
        if !job.target.starts_with("http://") && !job.target.starts_with("https://") {
            return Err(ExtractError::Config(format!(
                "page job {} needs an http(s) target, got {:?}",
                job.name, job.target
            )));
        }

        let resp = self.client.get(&job.target).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, resp.url().as_str()));
        }
        let body = resp.text().await?;
        let candidates = parse_page(&body, job)?;
        debug!(job = %job.name, bytes = body.len(), candidates = candidates.len(), "parsed page");
        Ok(Extraction::of(candidates))
    }
}

fn selector(raw: &str) -> Result<Selector, ExtractError> {
    Selector::parse(raw).map_err(|err| ExtractError::Config(format!("bad selector {raw:?}: {err}")))
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn first_text(el: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    el.select(sel)
        .map(|node| element_text(&node))
        .find(|text| !text.is_empty())
}

/// Parses listing items out of an HTML document using the job's selectors.
pub fn parse_page(html: &str, job: &Job) -> Result<Vec<CandidateRecord>, ExtractError> {
    let selectors = job.selectors.clone().unwrap_or_default();
    let item_sel = selector(selectors.item.as_deref().unwrap_or(DEFAULT_ITEM_SELECTOR))?;
    let name_sel = selector(selectors.name.as_deref().unwrap_or(DEFAULT_NAME_SELECTOR))?;
    let description_sel = selectors.description.as_deref().map(selector).transpose()?;
    let address_sel = selectors.address.as_deref().map(selector).transpose()?;
    let link_sel = selector("a[href]")?;

    let document = Html::parse_document(html);
    let scraped_at = Utc::now().to_rfc3339();
    let mut candidates = Vec::new();

    for item in document.select(&item_sel) {
        let Some(name) = first_text(&item, &name_sel) else {
            continue;
        };
        let text = element_text(&item);

        let description = match &description_sel {
            Some(sel) => first_text(&item, sel),
            None => {
                let rest = text.strip_prefix(name.as_str()).unwrap_or(&text).trim();
                (!rest.is_empty()).then(|| rest.chars().take(MAX_DESCRIPTION_CHARS).collect())
            }
        };
        let address = address_sel.as_ref().and_then(|sel| first_text(&item, sel));

        let mut website = None;
        let mut mailto = None;
        for link in item.select(&link_sel) {
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            if let Some(addr) = href.strip_prefix("mailto:") {
                mailto.get_or_insert_with(|| addr.to_string());
            } else if href.starts_with("http://") || href.starts_with("https://") {
                website.get_or_insert_with(|| href.to_string());
            }
        }

        let mut metadata = Metadata::new();
        metadata.insert("source_url".into(), json!(job.target));
        metadata.insert("extraction_method".into(), json!("page"));
        metadata.insert("scraped_at".into(), json!(scraped_at));

        candidates.push(CandidateRecord {
            phone: find_phone(&text),
            email: mailto.or_else(|| find_email(&text)),
            name: Some(name),
            description,
            address,
            website,
            category: job.category.clone(),
            source: job.target.clone(),
            confidence: None,
            metadata,
        });
    }

    Ok(candidates)
}

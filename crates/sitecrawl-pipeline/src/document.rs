use chrono::{SecondsFormat, Utc};
use lazy_static::lazy_static;
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use url::Url;

lazy_static! {
    static ref HTML: Selector = Selector::parse("html").unwrap();
    static ref TITLE: Selector = Selector::parse("title").unwrap();
    static ref BODY: Selector = Selector::parse("body").unwrap();
    static ref PARAGRAPH: Selector = Selector::parse("p").unwrap();
    static ref META: Selector = Selector::parse("meta").unwrap();
}

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "svg"];

/// A page converted to the shape the search index expects.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub id: String,
    pub language: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: String,
    pub thumbnail_url: Option<String>,
    pub domain_name: String,
    pub path: String,
    pub url_path: String,
    pub basename: String,
    pub extension: Option<String>,
    pub created_at: String,
}

impl IndexDocument {
    /// The `_source` body, with language qualified text fields
    pub fn to_source(&self) -> Value {
        let lang = &self.language;
        let mut source = json!({
            "id": self.id,
            "language": self.language,
            "mime_type": "text/html",
            "thumbnail_url": self.thumbnail_url,
            "domain_name": self.domain_name,
            "path": self.path,
            "url_path": self.url_path,
            "basename": self.basename,
            "extension": self.extension,
            "created_at": self.created_at,
            "updated_at": self.created_at,
        });
        if let Value::Object(fields) = &mut source {
            fields.insert(format!("title_{lang}"), json!(self.title));
            fields.insert(format!("description_{lang}"), json!(self.description));
            fields.insert(format!("content_{lang}"), json!(self.content));
        }
        source
    }
}

/// Extracts an index document from a page. `None` when the page carries no text at all.
pub fn convert_html(html: &str, url: &str, domain_name: Option<&str>) -> Option<IndexDocument> {
    let page = Html::parse_document(html);

    let title = page
        .select(&TITLE)
        .next()
        .map(|t| sanitize_text(&t.text().collect::<String>()))
        .filter(|t| !t.is_empty())
        .or_else(|| meta_content(&page, "og:title"))
        .or_else(|| meta_content(&page, "og:site_name"));

    let first_paragraph = page
        .select(&PARAGRAPH)
        .map(|p| sanitize_text(&p.text().collect::<String>()))
        .find(|p| !p.is_empty());
    let description = meta_content(&page, "description")
        .or_else(|| meta_content(&page, "og:description"))
        .or(first_paragraph);

    let content = page
        .select(&BODY)
        .next()
        .map(visible_text)
        .filter(|text| !text.is_empty())
        .or_else(|| description.clone())
        .or_else(|| title.clone())?;

    let language = page
        .select(&HTML)
        .next()
        .and_then(|html| html.value().attr("lang"))
        .and_then(|lang| lang.split(['-', '_']).next())
        .map(|lang| lang.trim().to_ascii_lowercase())
        .filter(|lang| !lang.is_empty())
        .unwrap_or_else(|| String::from("en"));

    let parsed = Url::parse(url).ok();
    let canonical = parsed
        .as_ref()
        .map(|u| u.to_string())
        .unwrap_or_else(|| url.to_string());
    let url_path = parsed
        .as_ref()
        .map(|u| u.path().to_string())
        .unwrap_or_default();
    let domain_name = domain_name
        .map(String::from)
        .or_else(|| parsed.as_ref().and_then(|u| u.host_str().map(String::from)))
        .unwrap_or_default();
    let (basename, extension) = base_extension(&url_path);

    Some(IndexDocument {
        id: url_sha256(&canonical),
        language,
        title,
        description,
        content,
        thumbnail_url: meta_content(&page, "og:image"),
        domain_name,
        path: canonical,
        url_path,
        basename,
        extension,
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

pub fn url_sha256(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

fn meta_content(page: &Html, key: &str) -> Option<String> {
    page.select(&META)
        .find(|meta| {
            let m = meta.value();
            m.attr("name")
                .or_else(|| m.attr("property"))
                .map(|name| name.eq_ignore_ascii_case(key))
                .unwrap_or(false)
        })
        .and_then(|meta| meta.value().attr("content"))
        .map(sanitize_text)
        .filter(|content| !content.is_empty())
}

fn visible_text(root: ElementRef) -> String {
    let mut parts = vec![];
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .map(|e| SKIPPED_ELEMENTS.contains(&e.name()))
                .unwrap_or(false)
        });
        if !hidden {
            parts.push(&**text);
        }
    }
    sanitize_text(&parts.join(" "))
}

/// Drops control characters and collapses whitespace runs
pub fn sanitize_text(text: &str) -> String {
    let printable: String = text
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .filter(|c| *c != '\u{2424}')
        .collect();
    printable.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn base_extension(url_path: &str) -> (String, Option<String>) {
    let file = url_path.rsplit('/').next().unwrap_or_default();
    match file.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() && !ext.is_empty() => {
            (base.to_string(), Some(format!(".{ext}")))
        }
        _ => (file.to_string(), None),
    }
}

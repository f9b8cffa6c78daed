use lazy_static::lazy_static;
use regex::{Regex, RegexSet};
use url::Url;

use crate::scope::ScopeFilter;

#[rustfmt::skip]
const DENY_EXTENSIONS: &[&str] = &[
    // archives
    "7z", "7zip", "bz2", "rar", "tar", "tar.gz", "xz", "zip", "gz",
    // images
    "mng", "pct", "bmp", "gif", "jpg", "jpeg", "png", "pst", "psp", "image",
    "tif", "tiff", "ai", "drw", "dxf", "eps", "ps", "svg", "cdr", "ico",
    // audio
    "mp3", "wma", "ogg", "wav", "ra", "aac", "mid", "au", "aiff", "media",
    // video
    "3gp", "asf", "asx", "avi", "mov", "mp4", "mpg", "qt", "rm", "swf",
    "wmv", "m4a", "m4v", "flv", "webm",
    // office suites
    "ppt", "pptx", "pps", "odt", "ods", "odg", "odp",
    // other
    "css", "exe", "bin", "rss", "dmg", "iso", "apk", "js", "xml", "ibooks",
    "cfm", "ics", "nc", "prj", "sfx", "eventsource", "fetch",
    "stylesheet", "websocket", "xhr", "font", "manifest",
];

const DENY_PATTERNS: &[&str] = &["calendar", "location-contact", "DTMO-Site-Map/FileId/"];

const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "text/html",
    "text/plain",
    "application/msword",
    "application/pdf",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

lazy_static! {
    static ref DENY_SET: RegexSet =
        RegexSet::new(DENY_PATTERNS.iter().map(|p| regex::escape(p))).unwrap();
    static ref CONTENT_TYPES: Regex = Regex::new(
        &ALLOWED_CONTENT_TYPES
            .iter()
            .map(|t| regex::escape(t))
            .collect::<Vec<_>>()
            .join("|")
    )
    .unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkRejection {
    #[error("invalid URL")]
    InvalidUrl,
    #[error("URL is outside of the domain scope")]
    OutOfScope,
    #[error("URL has a query string")]
    QueryString,
    #[error("URL has denied extension `{0}`")]
    DeniedExtension(String),
    #[error("URL matches denied pattern `{0}`")]
    DeniedPattern(&'static str),
}

/// Everything a discovered link must satisfy before the worker follows it.
#[derive(Debug, Clone)]
pub struct LinkRules {
    scope: ScopeFilter,
    allow_query_string: bool,
}

impl LinkRules {
    pub fn with_scope(scope: ScopeFilter, allow_query_string: bool) -> Self {
        Self {
            scope,
            allow_query_string,
        }
    }

    pub fn scope(&self) -> &ScopeFilter {
        &self.scope
    }

    pub fn check(&self, url: &str) -> Result<(), LinkRejection> {
        let parsed = Url::parse(url).map_err(|_| LinkRejection::InvalidUrl)?;

        if !self.allow_query_string && parsed.query().is_some() {
            return Err(LinkRejection::QueryString);
        }

        if let Some(ext) = denied_extension(parsed.path()) {
            return Err(LinkRejection::DeniedExtension(ext));
        }

        if let Some(i) = DENY_SET.matches(url).iter().next() {
            return Err(LinkRejection::DeniedPattern(DENY_PATTERNS[i]));
        }

        if !self.scope.admits(url) {
            return Err(LinkRejection::OutOfScope);
        }

        Ok(())
    }

    pub fn admits(&self, url: &str) -> bool {
        self.check(url).is_ok()
    }
}

fn denied_extension(path: &str) -> Option<String> {
    let file = path.rsplit('/').next()?.to_ascii_lowercase();
    DENY_EXTENSIONS
        .iter()
        .filter(|ext| {
            file.len() > ext.len() + 1
                && file.ends_with(*ext)
                && file[..file.len() - ext.len()].ends_with('.')
        })
        .max_by_key(|ext| ext.len())
        .map(|ext| ext.to_string())
}

/// Whether a response `Content-Type` header is worth delivering
pub fn is_valid_content_type(header: &str) -> bool {
    CONTENT_TYPES.is_match(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(allow_query_string: bool) -> LinkRules {
        LinkRules::with_scope(ScopeFilter::new("example.com"), allow_query_string)
    }

    #[test]
    fn query_strings_need_opt_in() {
        assert_eq!(
            rules(false).check("http://www.example.com/test?parm=value"),
            Err(LinkRejection::QueryString)
        );
        assert!(rules(true).admits("http://www.example.com/test?parm=value"));
    }

    #[test]
    fn denied_extensions() {
        assert_eq!(
            rules(false).check("https://example.com/files/archive.tar.gz"),
            Err(LinkRejection::DeniedExtension("tar.gz".into()))
        );
        assert_eq!(
            rules(false).check("https://example.com/img/LOGO.PNG"),
            Err(LinkRejection::DeniedExtension("png".into()))
        );
        assert!(rules(false).admits("https://example.com/report.pdf"));
        assert!(rules(false).admits("https://example.com/js"));
    }

    #[test]
    fn denied_patterns() {
        assert_eq!(
            rules(false).check("https://example.com/events/calendar/2024"),
            Err(LinkRejection::DeniedPattern("calendar"))
        );
    }

    #[test]
    fn scope_is_applied_last() {
        assert_eq!(
            rules(false).check("https://other.com/page"),
            Err(LinkRejection::OutOfScope)
        );
        assert_eq!(rules(false).check("::"), Err(LinkRejection::InvalidUrl));
    }

    #[test]
    fn content_types() {
        assert!(is_valid_content_type("text/html; charset=utf-8"));
        assert!(is_valid_content_type("application/pdf"));
        assert!(!is_valid_content_type("image/png"));
        assert!(!is_valid_content_type(""));
    }
}

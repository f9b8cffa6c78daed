//! Domain scope admission.
//!
//! A scope is a comma separated list of `host[/path-prefix]` entries. Two matchers
//! are compiled once per job: one over discovered hostnames, one over complete URLs.
//! A link is in scope only when both accept it.

use lazy_static::lazy_static;
use regex::Regex;
use url::Url;

lazy_static! {
    static ref URL_ENTRY: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*://").unwrap();
    static ref PORT_ENTRY: Regex = Regex::new(r":\d+$").unwrap();
}

/// Prefix every URL carries before its host: scheme, optional credentials, optional `www.`
const URL_PREFIX: &str = r"^(?i:[a-z][a-z0-9+.\-]*://(?:[^/?#@]*@)?(?:www\.)?)";

/// What may follow a host-only entry
const HOST_BOUNDARY: &str = r"(?::\d+)?(?:[/?#]|$)";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    #[error("scope accepts only domains, not URLs. Ignoring URL entry {0}")]
    UrlEntry(String),
    #[error("scope accepts only domains without ports. Ignoring entry {0}")]
    PortEntry(String),
}

#[derive(Debug, Clone)]
pub struct ScopeFilter {
    hosts: Option<Regex>,
    paths: Option<Regex>,
    rejected: Vec<ScopeError>,
}

impl ScopeFilter {
    pub fn new(scope: &str) -> Self {
        let mut hosts = vec![];
        let mut paths = vec![];
        let mut has_path = false;
        let mut rejected = vec![];

        for entry in scope.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if URL_ENTRY.is_match(entry) {
                let e = ScopeError::UrlEntry(entry.to_string());
                log::warn!("{e}");
                rejected.push(e);
                continue;
            }

            let (host, path) = match entry.find('/') {
                Some(i) => entry.split_at(i),
                None => (entry, ""),
            };
            if PORT_ENTRY.is_match(host) {
                let e = ScopeError::PortEntry(entry.to_string());
                log::warn!("{e}");
                rejected.push(e);
                continue;
            }

            let host = regex::escape(&host.to_ascii_lowercase());
            let path = path.trim_end_matches('*');
            if path.is_empty() || path == "/" {
                paths.push(format!("(?i:{host}){HOST_BOUNDARY}"));
            } else {
                has_path = true;
                paths.push(format!("(?i:{host})(?::\\d+)?{}", regex::escape(path)));
            }
            hosts.push(host);
        }

        if hosts.is_empty() {
            log::warn!("No usable entry in scope `{scope}`, every link will be rejected");
        }

        Self {
            hosts: compile(&hosts, |alts| format!(r"^(?:www\.)?(?:{alts})$")),
            paths: if has_path {
                compile(&paths, |alts| format!("{URL_PREFIX}(?:{alts})"))
            } else {
                None
            },
            rejected,
        }
    }

    /// Entries that were excluded when the filter was built
    pub fn rejected(&self) -> &[ScopeError] {
        &self.rejected
    }

    pub fn host_matches(&self, host: &str) -> bool {
        self.hosts
            .as_ref()
            .map(|re| re.is_match(&host.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    pub fn path_matches(&self, url: &str) -> bool {
        self.paths.as_ref().map(|re| re.is_match(url)).unwrap_or(true)
    }

    pub fn admits(&self, url: &str) -> bool {
        let host = match Url::parse(url) {
            Ok(parsed) => parsed.host_str().map(String::from),
            Err(_) => None,
        };
        match host {
            Some(host) => self.host_matches(&host) && self.path_matches(url),
            None => false,
        }
    }
}

fn compile(alternatives: &[String], wrap: impl Fn(&str) -> String) -> Option<Regex> {
    if alternatives.is_empty() {
        return None;
    }
    let pattern = wrap(&alternatives.join("|"));
    match Regex::new(&pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            log::error!("Couldn't compile scope pattern {pattern} got: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_only_scope_rejects_other_subdomains() {
        let filter = ScopeFilter::new("example.com");

        assert!(filter.admits("http://example.com/x"));
        assert!(filter.admits("https://www.example.com/1"));
        assert!(!filter.admits("http://sub.example.com/x"));
        assert!(!filter.admits("http://notexample.com/x"));
    }

    #[test]
    fn path_scope_restricts_prefix() {
        let filter = ScopeFilter::new("example.com/blog");

        assert!(filter.admits("http://example.com/blog/post1"));
        assert!(!filter.admits("http://example.com/other"));
        assert!(!filter.admits("http://example.com/"));
    }

    #[test]
    fn mixed_entries_apply_per_host() {
        let filter = ScopeFilter::new("a.gov, b.gov/news/");

        assert!(filter.admits("https://a.gov/anything"));
        assert!(filter.admits("https://a.gov"));
        assert!(filter.admits("https://b.gov/news/today"));
        assert!(!filter.admits("https://b.gov/about"));
    }

    #[test]
    fn ports_never_participate() {
        let filter = ScopeFilter::new("example.com/blog");

        assert!(filter.admits("http://example.com:8080/blog/post1"));
        assert!(!filter.admits("http://example.com:8080/other"));
    }

    #[test]
    fn url_and_port_entries_are_excluded() {
        let filter = ScopeFilter::new("http://www.example.com,example.com:443,example.org");

        assert_eq!(
            filter.rejected(),
            &[
                ScopeError::UrlEntry("http://www.example.com".into()),
                ScopeError::PortEntry("example.com:443".into()),
            ]
        );
        assert!(!filter.admits("http://www.example.com/"));
        assert!(filter.admits("http://example.org/"));
    }

    #[test]
    fn entry_escaping() {
        let filter = ScopeFilter::new("example.com");

        assert!(!filter.admits("http://exampleXcom/"));
        assert!(!filter.admits("not a url"));
        assert!(!filter.admits("mailto:someone@example.com"));
    }

    #[test]
    fn empty_scope_admits_nothing() {
        let filter = ScopeFilter::new(" , ");

        assert!(!filter.admits("http://example.com/"));
    }
}

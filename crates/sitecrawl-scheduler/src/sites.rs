use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use sitecrawl_pipeline::{OutputTarget, UnknownOutputTarget};

use crate::config::WorkerCommand;
use crate::slots::{ScheduleSlot, SlotAllocator, SlotError};

const REQUIRED_FIELDS: [&str; 6] = [
    "name",
    "allow_query_string",
    "allowed_domains",
    "handle_javascript",
    "starting_urls",
    "output_target",
];

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Couldn't read {path:?} got: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid crawl sites JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("crawl sites must be a JSON array of records")]
    NotAnArray,
    #[error("record {index} is not a JSON object")]
    NotAnObject { index: usize },
    #[error("record {index}: all CrawlSite fields are required, add values for {}", .fields.join(","))]
    MissingFields {
        index: usize,
        fields: Vec<&'static str>,
    },
    #[error("record {index}: invalid type, field {field} with value {value} must be {expected}")]
    InvalidType {
        index: usize,
        field: &'static str,
        value: Value,
        expected: &'static str,
    },
    #[error("record {index}: {source}")]
    InvalidTarget {
        index: usize,
        source: UnknownOutputTarget,
    },
    #[error("record {index}: unexpected field {field}")]
    UnknownField { index: usize, field: String },
    #[error(
        "the combination of allowed_domains and starting_urls must be unique, \
         repeated: {allowed_domains} {starting_urls}"
    )]
    Duplicate {
        allowed_domains: String,
        starting_urls: String,
    },
}

/// One site definition. Everything but `schedule` is mandatory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrawlSite {
    pub name: String,
    pub allow_query_string: bool,
    pub allowed_domains: String,
    pub handle_javascript: bool,
    pub starting_urls: String,
    pub schedule: Option<String>,
    pub output_target: OutputTarget,
}

impl CrawlSite {
    fn from_value(index: usize, value: &Value) -> Result<Self, RegistryError> {
        let record = value
            .as_object()
            .ok_or(RegistryError::NotAnObject { index })?;

        if let Some(field) = record
            .keys()
            .find(|k| *k != "schedule" && !REQUIRED_FIELDS.contains(&k.as_str()))
        {
            return Err(RegistryError::UnknownField {
                index,
                field: field.clone(),
            });
        }

        let missing = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|f| record.get(*f).map_or(true, Value::is_null))
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(RegistryError::MissingFields {
                index,
                fields: missing,
            });
        }

        let target = string_field(index, record, "output_target")?;
        let output_target = target
            .parse::<OutputTarget>()
            .map_err(|source| RegistryError::InvalidTarget { index, source })?;

        let schedule = match record.get("schedule") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(RegistryError::InvalidType {
                    index,
                    field: "schedule",
                    value: other.clone(),
                    expected: "a string or null",
                })
            }
        };

        Ok(Self {
            name: string_field(index, record, "name")?,
            allow_query_string: bool_field(index, record, "allow_query_string")?,
            allowed_domains: string_field(index, record, "allowed_domains")?,
            handle_javascript: bool_field(index, record, "handle_javascript")?,
            starting_urls: string_field(index, record, "starting_urls")?,
            schedule,
            output_target,
        })
    }

    /// Lowercase name with spaces turned into dashes
    pub fn job_id(&self) -> String {
        self.name.to_lowercase().replace(' ', "-").replace("---", "-")
    }

    /// Worker variant able to crawl this site
    pub fn spider<'a>(&self, command: &'a WorkerCommand) -> &'a str {
        if self.handle_javascript {
            &command.dynamic_spider
        } else {
            &command.static_spider
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.schedule
            .as_deref()
            .map_or(false, |s| !s.trim().is_empty())
    }
}

fn string_field(
    index: usize,
    record: &Map<String, Value>,
    field: &'static str,
) -> Result<String, RegistryError> {
    match &record[field] {
        Value::String(s) => Ok(s.clone()),
        other => Err(RegistryError::InvalidType {
            index,
            field,
            value: other.clone(),
            expected: "a string",
        }),
    }
}

fn bool_field(
    index: usize,
    record: &Map<String, Value>,
    field: &'static str,
) -> Result<bool, RegistryError> {
    record[field]
        .as_bool()
        .ok_or_else(|| RegistryError::InvalidType {
            index,
            field,
            value: record[field].clone(),
            expected: "a boolean",
        })
}

/// Validated set of crawl sites, read once at startup.
#[derive(Debug, Clone, Default)]
pub struct CrawlSites {
    sites: Vec<CrawlSite>,
}

impl CrawlSites {
    pub fn from_sites(sites: Vec<CrawlSite>) -> Result<Self, RegistryError> {
        let mut unique = HashSet::new();
        for site in &sites {
            if !unique.insert((&site.allowed_domains, &site.starting_urls)) {
                return Err(RegistryError::Duplicate {
                    allowed_domains: site.allowed_domains.clone(),
                    starting_urls: site.starting_urls.clone(),
                });
            }
        }
        Ok(Self { sites })
    }

    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        let value: Value = serde_json::from_str(json)?;
        let records = value.as_array().ok_or(RegistryError::NotAnArray)?;
        let sites = records
            .iter()
            .enumerate()
            .map(|(index, record)| CrawlSite::from_value(index, record))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_sites(sites)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let sites = Self::from_json(&json)?;
        log::info!("Loaded {} crawl sites from {path:?}", sites.len());
        Ok(sites)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CrawlSite> {
        self.sites.iter()
    }

    /// Only the sites with a non-empty schedule
    pub fn scheduled(&self) -> impl Iterator<Item = &CrawlSite> {
        self.sites.iter().filter(|site| site.is_scheduled())
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Gives every site, in order, its own weekly slot. Nothing changes if the
    /// allocator runs out before the last site.
    pub fn assign_slots(
        &mut self,
        allocator: &mut SlotAllocator,
    ) -> Result<Vec<ScheduleSlot>, SlotError> {
        let slots = self
            .sites
            .iter()
            .map(|_| allocator.next_slot())
            .collect::<Result<Vec<_>, _>>()?;
        for (site, slot) in self.sites.iter_mut().zip(&slots) {
            site.schedule = Some(slot.cron_expression());
        }
        Ok(slots)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.sites)
    }
}

impl<'a> IntoIterator for &'a CrawlSites {
    type Item = &'a CrawlSite;
    type IntoIter = std::slice::Iter<'a, CrawlSite>;

    fn into_iter(self) -> Self::IntoIter {
        self.sites.iter()
    }
}

//! Endpoint helpers for subreddit listings and search.

use std::str::FromStr;

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::{ApiClient, ClientConfig, ClientError, Credential, Paging, RecordStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeRange {
    Hour,
    #[default]
    Day,
    Week,
    Month,
    Year,
    All,
}

impl TimeRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
            Self::All => "all",
        }
    }
}

impl FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Hour, Self::Day, Self::Week, Self::Month, Self::Year, Self::All]
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown time range {s:?} (hour, day, week, month, year, all)"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchSort {
    #[default]
    Relevance,
    New,
    Top,
    Comments,
}

impl SearchSort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relevance => "relevance",
            Self::New => "new",
            Self::Top => "top",
            Self::Comments => "comments",
        }
    }
}

impl FromStr for SearchSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Relevance, Self::New, Self::Top, Self::Comments]
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown search sort {s:?} (relevance, new, top, comments)"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubredditSort {
    New,
    Top(TimeRange),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubredditListing {
    pub subreddit: String,
    pub sort: SubredditSort,
    pub paging: Paging,
}

impl SubredditListing {
    pub fn path(&self) -> Result<String, ClientError> {
        let sub = subreddit_name(&self.subreddit)?;
        Ok(match self.sort {
            SubredditSort::New => format!("/r/{sub}/new"),
            SubredditSort::Top(_) => format!("/r/{sub}/top"),
        })
    }

    pub fn query_params(&self) -> Vec<(String, String)> {
        match self.sort {
            SubredditSort::New => Vec::new(),
            SubredditSort::Top(range) => vec![("t".to_string(), range.as_str().to_string())],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    pub query: String,
    #[serde(default)]
    pub sort: SearchSort,
    #[serde(default = "all_time")]
    pub time: TimeRange,
    /// Restricts the search to one subreddit when set.
    #[serde(default)]
    pub restrict_to: Option<String>,
    #[serde(default)]
    pub include_over_18: Option<bool>,
    #[serde(default)]
    pub paging: Paging,
}

fn all_time() -> TimeRange {
    TimeRange::All
}

impl SearchParams {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            sort: SearchSort::Relevance,
            time: TimeRange::All,
            restrict_to: None,
            include_over_18: None,
            paging: Paging::default(),
        }
    }

    pub fn path(&self) -> Result<String, ClientError> {
        Ok(match &self.restrict_to {
            Some(sub) => format!("/r/{}/search", subreddit_name(sub)?),
            None => "/search".to_string(),
        })
    }

    pub fn query_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("q".to_string(), self.query.clone()),
            ("sort".to_string(), self.sort.as_str().to_string()),
            ("t".to_string(), self.time.as_str().to_string()),
            ("type".to_string(), "link".to_string()),
            ("raw_json".to_string(), "1".to_string()),
        ];
        if let Some(include) = self.include_over_18 {
            let flag = if include { "on" } else { "off" };
            params.push(("include_over_18".to_string(), flag.to_string()));
        }
        if self.restrict_to.is_some() {
            params.push(("restrict_sr".to_string(), "1".to_string()));
        }
        params
    }
}

/// Accepts `name`, `r/name` or `/r/name/`; the bare name must be `[A-Za-z0-9_]+`.
fn subreddit_name(raw: &str) -> Result<&str, ClientError> {
    let trimmed = raw.trim().trim_matches('/');
    let name = trimmed.strip_prefix("r/").unwrap_or(trimmed);
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(ClientError::InvalidParameter {
            name: "subreddit",
            value: raw.to_string(),
        })
    }
}

fn failed(err: ClientError) -> RecordStream {
    stream::iter([Err(err)]).boxed()
}

/// Typed entry points over the listing walker.
#[derive(Debug, Clone)]
pub struct RedditClient {
    api: ApiClient,
}

impl RedditClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            api: ApiClient::new(config)?,
        })
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Performs the credential exchange up front instead of on the first request.
    pub async fn authenticate(&self) -> Result<Credential, ClientError> {
        self.api.tokens().ensure_valid_credential().await
    }

    /// An invalid subreddit name yields a single error and sends nothing.
    pub fn subreddit(&self, listing: &SubredditListing) -> RecordStream {
        match listing.path() {
            Ok(path) => self.api.listing(path, listing.paging, listing.query_params()),
            Err(err) => failed(err),
        }
    }

    pub fn subreddit_new(&self, subreddit: &str, paging: Paging) -> RecordStream {
        self.subreddit(&SubredditListing {
            subreddit: subreddit.to_string(),
            sort: SubredditSort::New,
            paging,
        })
    }

    pub fn subreddit_top(&self, subreddit: &str, range: TimeRange, paging: Paging) -> RecordStream {
        self.subreddit(&SubredditListing {
            subreddit: subreddit.to_string(),
            sort: SubredditSort::Top(range),
            paging,
        })
    }

    pub fn search(&self, params: &SearchParams) -> RecordStream {
        match params.path() {
            Ok(path) => self.api.listing(path, params.paging, params.query_params()),
            Err(err) => failed(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subreddit_names_outside_the_plain_charset_are_rejected() {
        assert_eq!(subreddit_name("/r/Sneakers/").unwrap(), "Sneakers");
        assert_eq!(subreddit_name("rust_gamedev").unwrap(), "rust_gamedev");
        for bad in ["sneakers?limit=1", "sneakers#top", "a/b", "", "r/", "sne akers"] {
            assert!(
                matches!(
                    subreddit_name(bad),
                    Err(ClientError::InvalidParameter { name: "subreddit", .. })
                ),
                "{bad:?}"
            );
        }

        let mut params = SearchParams::new("air max");
        params.restrict_to = Some("sneakers&restrict_sr=0".to_string());
        assert!(params.path().is_err());
    }

    #[test]
    fn time_range_and_sort_parse_case_insensitively() {
        assert_eq!("Week".parse::<TimeRange>(), Ok(TimeRange::Week));
        assert_eq!("all".parse::<TimeRange>(), Ok(TimeRange::All));
        assert!("fortnight".parse::<TimeRange>().is_err());
        assert_eq!("comments".parse::<SearchSort>(), Ok(SearchSort::Comments));
    }

    #[test]
    fn top_listing_carries_time_range() {
        let listing = SubredditListing {
            subreddit: "r/sneakers".to_string(),
            sort: SubredditSort::Top(TimeRange::Week),
            paging: Paging::default(),
        };
        assert_eq!(listing.path().unwrap(), "/r/sneakers/top");
        assert_eq!(listing.query_params(), vec![("t".to_string(), "week".to_string())]);
    }

    #[test]
    fn global_search_has_no_restriction_flag() {
        let params = SearchParams::new("nike air max");
        assert_eq!(params.path().unwrap(), "/search");
        let keys: Vec<_> = params.query_params().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["q", "sort", "t", "type", "raw_json"]);
    }

    #[test]
    fn restricted_search_targets_subreddit_path() {
        let mut params = SearchParams::new("air max");
        params.restrict_to = Some("sneakers".to_string());
        params.include_over_18 = Some(false);
        params.sort = SearchSort::New;

        assert_eq!(params.path().unwrap(), "/r/sneakers/search");
        let query = params.query_params();
        assert!(query.contains(&("restrict_sr".to_string(), "1".to_string())));
        assert!(query.contains(&("include_over_18".to_string(), "off".to_string())));
        assert!(query.contains(&("sort".to_string(), "new".to_string())));
    }

    #[test]
    fn search_params_deserialize_with_defaults() {
        let params: SearchParams = serde_json::from_str(r#"{"query": "rust"}"#).unwrap();
        assert_eq!(params, SearchParams::new("rust"));
    }
}

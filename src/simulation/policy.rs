//! Routing policies: each simulated site is a pure function of the request
//! path and query to an optional status change plus the page to serve.

use std::collections::HashMap;

use crate::types::SimulationStatus;

/// Decoded query string. Keys submitted with an empty value are dropped,
/// so an unchecked or blank field reads the same as an absent one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(HashMap<String, Vec<String>>);

impl QueryParams {
    pub fn parse(raw: &str) -> Self {
        let mut params: HashMap<String, Vec<String>> = HashMap::new();
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            params
                .entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }
        Self(params)
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn is_cleared(&self, key: &str) -> bool {
        self.get(key).is_none()
    }

    /// True when `key` carries exactly one value, equal to `value`.
    pub fn is_exactly(&self, key: &str, value: &str) -> bool {
        matches!(self.get(key), Some([only]) if only == value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Page {
    /// Path relative to the asset root; sandboxed when served.
    Asset(String),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub status: Option<SimulationStatus>,
    pub page: Page,
}

impl Route {
    pub fn asset(path: impl Into<String>) -> Self {
        Self {
            status: None,
            page: Page::Asset(path.into()),
        }
    }

    pub fn decisive(status: SimulationStatus, path: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            page: Page::Asset(path.into()),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: None,
            page: Page::NotFound,
        }
    }
}

pub trait RoutingPolicy: Send + Sync {
    fn route(&self, path: &str, query: &QueryParams) -> Route;

    /// Status reported by `finish()` given the last decisive write.
    fn final_status(&self, recorded: SimulationStatus) -> SimulationStatus {
        recorded
    }
}

fn under(dir: &str, path: &str) -> String {
    let rel = path.trim_start_matches('/');
    if dir.is_empty() {
        rel.to_string()
    } else {
        format!("{dir}/{rel}")
    }
}

/// A page that needs nothing done: the inbox is already clean.
#[derive(Debug, Clone)]
pub struct StaticSite {
    index_page: String,
}

impl StaticSite {
    pub fn new(index_page: impl Into<String>) -> Self {
        Self {
            index_page: index_page.into(),
        }
    }
}

impl RoutingPolicy for StaticSite {
    fn route(&self, path: &str, _query: &QueryParams) -> Route {
        match path {
            "/" => Route::asset(self.index_page.as_str()),
            other => Route::asset(under("", other)),
        }
    }

    fn final_status(&self, _recorded: SimulationStatus) -> SimulationStatus {
        SimulationStatus::Success
    }
}

/// One decisive link or form away from done.
#[derive(Debug, Clone)]
pub struct SingleStep {
    index_page: String,
}

impl SingleStep {
    pub fn new(index_page: impl Into<String>) -> Self {
        Self {
            index_page: index_page.into(),
        }
    }
}

impl RoutingPolicy for SingleStep {
    fn route(&self, path: &str, _query: &QueryParams) -> Route {
        use SimulationStatus::{Failure, Success};
        match path {
            "/" => Route::asset(self.index_page.as_str()),
            "/unsubscribe" => Route::decisive(Success, "unsubscribed.html"),
            "/staysubscribed" => Route::decisive(Failure, "staysubscribed.html"),
            "/updated_success" => Route::decisive(Success, "updated.html"),
            "/updated_failure" => Route::decisive(Failure, "updated.html"),
            other => Route::asset(under("", other)),
        }
    }
}

/// How a preference-centre submission is judged.
#[derive(Debug, Clone)]
pub enum OptOutRule {
    /// Every listed per-category flag must be absent or blank.
    AllCleared(&'static [&'static str]),
    /// A dedicated "unsubscribe from everything" flag with this exact value.
    FlagEquals {
        key: &'static str,
        value: &'static str,
    },
}

impl OptOutRule {
    pub fn is_satisfied(&self, query: &QueryParams) -> bool {
        match self {
            OptOutRule::AllCleared(keys) => keys.iter().all(|k| query.is_cleared(k)),
            OptOutRule::FlagEquals { key, value } => query.is_exactly(key, value),
        }
    }
}

/// Vendor preference centre driven by a GET form. Opting out of some
/// categories is not enough; the rule decides what counts as "all".
#[derive(Debug, Clone)]
pub struct PreferenceCenter {
    /// Subdirectory holding this site's pages (empty for the root).
    pub dir: &'static str,
    pub index_page: &'static str,
    pub action_path: &'static str,
    pub rule: OptOutRule,
    /// Optional one-click "unsubscribe from all" endpoint.
    pub unsubscribe_all_path: Option<&'static str>,
    /// Page served for `/homepage`, which counts as giving up.
    pub homepage: Option<&'static str>,
}

impl PreferenceCenter {
    pub fn goldbelly() -> Self {
        Self {
            dir: "goldbelly",
            index_page: "goldbelly/index.html",
            action_path: "/email_preferences",
            rule: OptOutRule::FlagEquals {
                key: "user[unsubscribed]",
                value: "true",
            },
            unsubscribe_all_path: None,
            homepage: Some("goldbelly/homepage.html"),
        }
    }

    pub fn honeywell() -> Self {
        Self {
            dir: "honeywell",
            index_page: "honeywell/index.html",
            action_path: "/update_preferences",
            rule: OptOutRule::FlagEquals {
                key: "items[unsuball]",
                value: "unsuball",
            },
            unsubscribe_all_path: None,
            homepage: Some("honeywell/homepage.html"),
        }
    }

    pub fn peco() -> Self {
        Self {
            dir: "peco",
            index_page: "peco/index.html",
            action_path: "/update_preferences",
            rule: OptOutRule::AllCleared(&[
                "19", "22", "18", "9", "10", "14", "23", "25", "17", "26",
            ]),
            unsubscribe_all_path: None,
            homepage: None,
        }
    }

    pub fn fandango() -> Self {
        Self {
            dir: "",
            index_page: "fandango.html",
            action_path: "/update_preferences",
            rule: OptOutRule::AllCleared(&["sub1", "sub2", "sub3"]),
            unsubscribe_all_path: Some("/unsubscribe_all"),
            homepage: Some("404.html"),
        }
    }
}

impl RoutingPolicy for PreferenceCenter {
    fn route(&self, path: &str, query: &QueryParams) -> Route {
        use SimulationStatus::{Failure, Success};
        if path == "/" {
            return Route::asset(self.index_page);
        }
        if path == self.action_path {
            let status = if self.rule.is_satisfied(query) { Success } else { Failure };
            return Route::decisive(status, "updated.html");
        }
        if Some(path) == self.unsubscribe_all_path {
            return Route::decisive(Success, "updated.html");
        }
        if path == "/homepage" {
            if let Some(page) = self.homepage {
                return Route::decisive(Failure, page);
            }
        }
        Route::asset(under(self.dir, path))
    }
}

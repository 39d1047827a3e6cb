use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::services::PairedSession;

/// How many previously used sites are remembered.
pub const MAX_RECENT_SERVERS: usize = 5;

/// Locally stored session and client preferences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub site_url: Option<String>,
    pub token: Option<String>,
    pub user: Option<Value>,
    pub companies: Vec<Value>,
    pub config: Option<Value>,
    /// Overrides the default conversations file location.
    pub conversations_path: Option<PathBuf>,
    /// Most recent first.
    pub recent_servers: Vec<String>,
}

impl ClientSettings {
    pub fn is_paired(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        present(&self.site_url) && present(&self.token)
    }

    /// Move `url` to the front of the recent list, dropping duplicates and
    /// the oldest entries past the limit.
    pub fn remember_server(&mut self, url: &str) {
        self.recent_servers.retain(|s| s != url);
        self.recent_servers.insert(0, url.to_string());
        self.recent_servers.truncate(MAX_RECENT_SERVERS);
    }

    /// Store a freshly paired session.
    pub fn apply_pairing(&mut self, session: PairedSession) {
        self.remember_server(&session.site_url);
        self.site_url = Some(session.site_url);
        self.token = Some(session.token);
        self.user = Some(session.user);
        self.companies = session.companies;
        self.config = session.config;
    }

    /// Forget credentials. The site and the recent list are kept so pairing
    /// again is quick.
    pub fn clear_session(&mut self) {
        self.token = None;
        self.user = None;
        self.companies.clear();
        self.config = None;
    }
}

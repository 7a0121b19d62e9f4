/// Configuration for the remote message store and local cache
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the remote store (PostgREST-style service)
    pub base_url: String,

    /// Bearer token sent with every request
    pub bearer_token: String,

    /// Directory for the local cache database
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            bearer_token: String::new(),
            data_dir: PathBuf::from(".chatlink"),
        }
    }
}

impl Config {
    /// Resource endpoint for the `users` table
    pub fn users_url(&self) -> String {
        format!("{}/users", self.base_url)
    }

    /// Resource endpoint for the `messages` table
    pub fn messages_url(&self) -> String {
        format!("{}/messages", self.base_url)
    }

    /// Resource endpoint for the `follows` table
    pub fn follows_url(&self) -> String {
        format!("{}/follows", self.base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_urls() {
        let config = Config {
            base_url: "http://example.org/app".to_string(),
            ..Config::default()
        };
        assert_eq!(config.users_url(), "http://example.org/app/users");
        assert_eq!(config.messages_url(), "http://example.org/app/messages");
        assert_eq!(config.follows_url(), "http://example.org/app/follows");
    }
}

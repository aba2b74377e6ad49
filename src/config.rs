use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub backup_directory: String,
    pub store_path: String,
    /// Command printing the parsable increment listing; the backup
    /// directory is appended as the last argument
    #[serde(default = "default_listing_command")]
    pub listing_command: Vec<String>,
    /// Directory to list at every increment after syncing
    #[serde(default)]
    pub browse_path: Option<String>,
}

fn default_listing_command() -> Vec<String> {
    ["rdiff-backup", "--parsable-output", "-l"].iter().map(|s| s.to_string()).collect()
}

impl Config {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

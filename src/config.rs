use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::ConfigError;

/// Account used to mount the remote share.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    principal: String,
    secret: String,
}

impl Credential {
    /// `principal` may already be qualified as `domain\user`.
    pub fn new(principal: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            secret: secret.into(),
        }
    }

    /// Builds a `domainOrHost\user` principal.
    pub fn qualified(domain: &str, user: &str, secret: impl Into<String>) -> Self {
        Self::new(format!("{domain}\\{user}"), secret)
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Which export files the two streams append to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportLayout {
    /// `<base>.csv.conversations` and `<base>.csv.messages`.
    #[default]
    Split,
    /// Both streams into `<base>.csv.conversations`, as older archives were written.
    Combined,
}

/// Everything a monitor needs to reach its source and place its exports.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub host: String,
    pub source_path: String,
    pub file_name: String,
    pub target_dir: PathBuf,
    pub base_name: String,
    pub credential: Option<Credential>,
    pub layout: ExportLayout,
}

impl MonitorConfig {
    pub fn new(
        host: impl Into<String>,
        source_path: impl Into<String>,
        file_name: impl Into<String>,
        target_dir: impl Into<PathBuf>,
    ) -> Self {
        let file_name = file_name.into();
        Self {
            host: host.into(),
            source_path: source_path.into(),
            base_name: file_name.clone(),
            file_name,
            target_dir: target_dir.into(),
            credential: None,
            layout: ExportLayout::default(),
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_base_name(mut self, base_name: impl Into<String>) -> Self {
        self.base_name = base_name.into();
        self
    }

    pub fn with_layout(mut self, layout: ExportLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Validate every field and derive the remote address and export paths.
    pub fn resolve(&self) -> Result<ResolvedTargets, ConfigError> {
        let host = single_segment("host", self.host.trim_start_matches('\\'))?;
        let file_name = single_segment("file_name", &self.file_name)?;
        let base_name = single_segment("base_name", &self.base_name)?;

        let source = self
            .source_path
            .replace('/', "\\")
            .trim_matches('\\')
            .to_string();
        if source.is_empty() {
            return Err(ConfigError::Empty("source_path"));
        }

        let conversations_suffix = "conversations";
        let messages_suffix = match self.layout {
            ExportLayout::Split => "messages",
            ExportLayout::Combined => conversations_suffix,
        };

        Ok(ResolvedTargets {
            host: host.to_string(),
            remote_path: format!("\\\\{host}\\{source}\\{file_name}"),
            conversations_export: self
                .target_dir
                .join(format!("{base_name}.csv.{conversations_suffix}")),
            messages_export: self
                .target_dir
                .join(format!("{base_name}.csv.{messages_suffix}")),
        })
    }
}

fn single_segment<'a>(field: &'static str, value: &'a str) -> Result<&'a str, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::Empty(field));
    }
    if value.contains(['\\', '/']) {
        return Err(ConfigError::Separator {
            field,
            value: value.to_string(),
        });
    }
    Ok(value)
}

/// Paths derived from a [`MonitorConfig`], fixed for the lifetime of a monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTargets {
    pub host: String,
    /// `\\host\source\file`, handed to the database adapter.
    pub remote_path: String,
    pub conversations_export: PathBuf,
    pub messages_export: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MonitorConfig {
        MonitorConfig::new("HOST1", "Users/alice/AppData/Skype/alice", "main.db", "backup")
    }

    #[test]
    fn resolves_unc_path_and_split_exports() {
        let targets = config().resolve().unwrap();
        assert_eq!(targets.host, "HOST1");
        assert_eq!(
            targets.remote_path,
            r"\\HOST1\Users\alice\AppData\Skype\alice\main.db"
        );
        assert_eq!(
            targets.conversations_export,
            PathBuf::from("backup").join("main.db.csv.conversations")
        );
        assert_eq!(
            targets.messages_export,
            PathBuf::from("backup").join("main.db.csv.messages")
        );
    }

    #[test]
    fn combined_layout_shares_one_file() {
        let targets = config()
            .with_layout(ExportLayout::Combined)
            .with_base_name("alice")
            .resolve()
            .unwrap();
        assert_eq!(targets.conversations_export, targets.messages_export);
        assert!(targets.messages_export.ends_with("alice.csv.conversations"));
    }

    #[test]
    fn trims_separators_around_source_path() {
        let mut cfg = config();
        cfg.source_path = r"\share\skype\".to_string();
        cfg.host = r"\\HOST1".to_string();
        assert_eq!(cfg.resolve().unwrap().remote_path, r"\\HOST1\share\skype\main.db");
    }

    #[test]
    fn rejects_empty_and_nested_fields() {
        let mut cfg = config();
        cfg.host = "  ".to_string();
        assert!(matches!(cfg.resolve(), Err(ConfigError::Empty("host"))));

        let mut cfg = config();
        cfg.source_path = "/".to_string();
        assert!(matches!(cfg.resolve(), Err(ConfigError::Empty("source_path"))));

        let mut cfg = config();
        cfg.file_name = "db/main.db".to_string();
        assert!(matches!(
            cfg.resolve(),
            Err(ConfigError::Separator { field: "file_name", .. })
        ));
    }

    #[test]
    fn qualified_credential_hides_secret() {
        let cred = Credential::qualified("corp", "alice", "s3cret");
        assert_eq!(cred.principal(), r"corp\alice");
        let shown = format!("{cred:?}");
        assert!(!shown.contains("s3cret"));
    }
}

use super::models::Config;

/// Non-fatal findings surfaced at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push(&mut self, message: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint(
        &mut self,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Checks that are worth a warning but should not stop the process.
pub fn collect_warnings(config: &Config) -> ConfigWarnings {
    let mut warnings = ConfigWarnings::default();

    if config.database.url.is_none() {
        warnings.push_with_hint(
            "No database URL configured",
            "Set DATABASE_URL or database.url; both roles need Postgres",
        );
    }

    if config
        .storage
        .public_base_url
        .host_str()
        .is_some_and(|host| host == "localhost" || host == "127.0.0.1")
    {
        warnings.push_with_hint(
            format!(
                "Artifact URLs point at {}",
                config.storage.public_base_url
            ),
            "Set ARTIFACT_PUBLIC_URL to the address clients use to fetch artifacts",
        );
    }

    if config.pipeline.media.work_dir.starts_with(&config.storage.root) {
        warnings.push(
            "pipeline.media.work_dir lies inside the artifact root; scratch files may be published",
        );
    }

    warnings
}

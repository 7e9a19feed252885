//! Configuration surface shared by both CLI binaries (§6, §10.3). Mirrors
//! `original_source/config.go`'s `Config`/`SMTPConfig`/`MailSendConfig`
//! field-for-field, including its override semantics: a `-config` file,
//! when given, replaces the flags entirely rather than merging with them.

use std::path::Path;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MailSendConfig {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub mails: Vec<MailSendConfig>,
    #[serde(default)]
    pub template: Option<MailTemplateConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MailTemplateConfig {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, clap::ValueEnum, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Host,
    Vm,
}

/// Shared flags for `directorybackup` and `machinebackup` (§6's common
/// option table), plus each binary's private flags folded in as
/// `Option`s so one struct can serve both CLI surfaces.
#[derive(Parser, Debug, Clone, Serialize, Deserialize, Default)]
#[command(author, version, about)]
pub struct Config {
    #[arg(long = "baseurl", default_value = "")]
    #[serde(rename = "baseurl", default)]
    pub base_url: String,

    #[arg(long = "certfingerprint", default_value = "")]
    #[serde(rename = "certfingerprint", default)]
    pub cert_fingerprint: String,

    #[arg(long = "authid", default_value = "")]
    #[serde(rename = "authid", default)]
    pub auth_id: String,

    #[arg(long = "secret", default_value = "")]
    #[serde(default)]
    pub secret: String,

    #[arg(long = "datastore", default_value = "")]
    #[serde(default)]
    pub datastore: String,

    #[arg(long = "namespace", default_value = "")]
    #[serde(default)]
    pub namespace: String,

    #[arg(long = "backup-id", default_value = "")]
    #[serde(rename = "backup-id", default)]
    pub backup_id: String,

    #[arg(long = "backupdir", default_value = "")]
    #[serde(rename = "backupdir", default)]
    pub backup_source_dir: String,

    #[arg(long = "pxarout", default_value = "")]
    #[serde(rename = "pxarout", default)]
    pub pxar_out: String,

    /// `machinebackup`-only; repeated `-backupdev`.
    #[arg(long = "backupdev")]
    #[serde(default)]
    pub backup_dev: Vec<String>,

    /// `machinebackup`-only.
    #[arg(long = "type", value_enum)]
    #[serde(default)]
    pub backup_type: Option<BackupKind>,

    #[arg(long = "systray", default_value_t = false)]
    #[serde(default)]
    pub systray: bool,

    #[arg(long = "mail-host", default_value = "")]
    #[serde(skip)]
    pub mail_host: String,
    #[arg(long = "mail-port", default_value = "")]
    #[serde(skip)]
    pub mail_port: String,
    #[arg(long = "mail-username", default_value = "")]
    #[serde(skip)]
    pub mail_username: String,
    #[arg(long = "mail-password", default_value = "")]
    #[serde(skip)]
    pub mail_password: String,
    #[arg(long = "mail-insecure", default_value_t = false)]
    #[serde(skip)]
    pub mail_insecure: bool,
    #[arg(long = "mail-from", default_value = "")]
    #[serde(skip)]
    pub mail_from: String,
    #[arg(long = "mail-to", default_value = "")]
    #[serde(skip)]
    pub mail_to: String,

    #[arg(long = "config")]
    #[serde(skip)]
    pub config_file: Option<String>,

    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
}

impl Config {
    /// Parse flags, then — if `-config` names a file — replace the whole
    /// struct with that file's JSON contents (no merge), matching the
    /// original source's override semantics exactly.
    pub fn from_args() -> Result<Self, ConfigError> {
        let mut config = Config::parse();
        if let Some(path) = config.config_file.clone() {
            config = Self::from_file(Path::new(&path))?;
        } else {
            config.fold_mail_flags();
        }
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::ParseFile {
            path: path.display().to_string(),
            source,
        })
    }

    /// Lower the flat `-mail-*` flags into `smtp`, lazily creating the
    /// sections they touch (mirrors `initSmtpConfigIfNeeded`/
    /// `initMailConfsIfNeeded` in the original source).
    fn fold_mail_flags(&mut self) {
        let touches_smtp = !self.mail_host.is_empty()
            || !self.mail_port.is_empty()
            || !self.mail_username.is_empty()
            || !self.mail_password.is_empty()
            || self.mail_insecure;
        let touches_mail = !self.mail_from.is_empty() || !self.mail_to.is_empty();

        if !touches_smtp && !touches_mail {
            return;
        }

        let smtp = self.smtp.get_or_insert_with(SmtpConfig::default);
        if !self.mail_host.is_empty() {
            smtp.host = self.mail_host.clone();
        }
        if !self.mail_port.is_empty() {
            smtp.port = self.mail_port.clone();
        }
        if !self.mail_username.is_empty() {
            smtp.username = self.mail_username.clone();
        }
        if !self.mail_password.is_empty() {
            smtp.password = self.mail_password.clone();
        }
        if self.mail_insecure {
            smtp.insecure = true;
        }
        if touches_mail {
            if smtp.mails.is_empty() {
                smtp.mails.push(MailSendConfig::default());
            }
            if !self.mail_from.is_empty() {
                smtp.mails[0].from = self.mail_from.clone();
            }
            if !self.mail_to.is_empty() {
                smtp.mails[0].to = self.mail_to.clone();
            }
        }
    }

    /// Collects every missing mandatory field rather than stopping at the
    /// first (friendlier than the original source's `valid() bool`, same
    /// intent).
    pub fn validate(&self, require_backup_source: bool) -> Result<(), ConfigError> {
        let mut missing = Vec::new();

        if self.base_url.is_empty() {
            missing.push("baseurl");
        }
        if self.auth_id.is_empty() {
            missing.push("authid");
        }
        if self.secret.is_empty() {
            missing.push("secret");
        }
        if self.datastore.is_empty() {
            missing.push("datastore");
        }
        if require_backup_source && self.backup_source_dir.is_empty() && self.backup_dev.is_empty() {
            missing.push("backupdir/backupdev");
        }

        if let Some(smtp) = &self.smtp {
            if smtp.host.is_empty() {
                missing.push("smtp.host");
            }
            if smtp.port.is_empty() {
                missing.push("smtp.port");
            }
            if smtp.username.is_empty() {
                missing.push("smtp.username");
            }
            if smtp.password.is_empty() {
                missing.push("smtp.password");
            }
            if smtp.mails.is_empty() {
                missing.push("smtp.mails");
            }
            for mail in &smtp.mails {
                if mail.from.is_empty() {
                    missing.push("smtp.mails[].from");
                }
                if mail.to.is_empty() {
                    missing.push("smtp.mails[].to");
                }
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingFields(missing.join(", ")))
        }
    }

    /// §6: `-backup-id` defaults to the local hostname when unset.
    pub fn resolved_backup_id(&self) -> String {
        if !self.backup_id.is_empty() {
            return self.backup_id.clone();
        }
        hostname()
    }
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    nix::unistd::gethostname(&mut buf)
        .ok()
        .and_then(|cstr| cstr.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}

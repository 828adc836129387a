use std::{fs, path::Path, time::Duration};

use serde::Deserialize;

use crate::{
    CredentialStore, OpensslSigner, SigningPolicy, DEFAULT_BUNDLE_EXTENSION, DEFAULT_CERT_DIR,
    DEFAULT_MAX_OUTPUT,
};

/// Top-level configuration for the signing gate.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub smime: SmimeConfig,
}

/// S/MIME signing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SmimeConfig {
    /// Envelope senders whose messages may be signed (case-insensitive).
    #[serde(default)]
    pub allowed_emails: Vec<String>,

    /// Directory holding one credential bundle per sender.
    #[serde(default = "default_cert_dir")]
    pub cert_dir: String,

    /// File extension of the credential bundles.
    #[serde(default = "default_bundle_extension")]
    pub bundle_extension: String,

    #[serde(default)]
    pub signer: SignerConfig,
}

impl Default for SmimeConfig {
    fn default() -> Self {
        Self {
            allowed_emails: Vec::new(),
            cert_dir: default_cert_dir(),
            bundle_extension: default_bundle_extension(),
            signer: SignerConfig::default(),
        }
    }
}

impl SmimeConfig {
    /// Builds the signing policy from the allow-list.
    pub fn policy(&self) -> SigningPolicy {
        SigningPolicy::new(self.allowed_emails.iter().cloned())
    }

    /// Builds the credential store from the certificate directory.
    pub fn credentials(&self) -> CredentialStore {
        CredentialStore::new(&self.cert_dir, &self.bundle_extension)
    }

    /// Builds the OpenSSL signer from the signer section.
    pub fn signer(&self) -> OpensslSigner {
        OpensslSigner::with_launcher(self.signer.command.iter().cloned())
            .with_extra_args(self.signer.extra_args.iter().cloned())
            .with_timeout(self.signer.timeout())
            .with_max_output(self.signer.max_output_bytes)
    }
}

/// External signing process configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    /// Program followed by its leading arguments.
    #[serde(default = "default_command")]
    pub command: Vec<String>,

    /// Arguments appended after the signing arguments.
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Time limit for one signing process, `0` disables it.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl SignerConfig {
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            extra_args: Vec::new(),
            timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    toml::from_str(&content).map_err(ConfigError::Parse)
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// An I/O error occurred reading the file.
    Io(std::io::Error),
    /// A parse error occurred deserializing TOML.
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Config I/O error: {e}"),
            ConfigError::Parse(e) => write!(f, "Config parse error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn default_cert_dir() -> String {
    DEFAULT_CERT_DIR.to_string()
}

fn default_bundle_extension() -> String {
    DEFAULT_BUNDLE_EXTENSION.to_string()
}

fn default_command() -> Vec<String> {
    vec!["openssl".to_string()]
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[smime]
allowed_emails = ["Alice@Example.com", "bob.smith@corp.io"]
cert_dir = "/etc/smime"
bundle_extension = "pfx"

[smime.signer]
command = ["/usr/bin/env", "openssl"]
extra_args = ["-passin", "pass:secret"]
timeout_secs = 5
max_output_bytes = 1024
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.smime.allowed_emails.len(), 2);
        assert_eq!(config.smime.cert_dir, "/etc/smime");
        assert_eq!(config.smime.bundle_extension, "pfx");
        assert_eq!(config.smime.signer.command, ["/usr/bin/env", "openssl"]);
        assert_eq!(config.smime.signer.extra_args, ["-passin", "pass:secret"]);
        assert_eq!(config.smime.signer.timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.smime.signer.max_output_bytes, 1024);

        assert_eq!(
            config.smime.credentials().bundle_path("bob.smith@corp.io"),
            PathBuf::from("/etc/smime/bob_smith_corp_io.pfx")
        );
        assert!(config
            .smime
            .policy()
            .evaluate("alice@example.com", Some("<alice@example.com>"))
            .is_eligible());

        let signer = config.smime.signer();
        assert_eq!(signer.program(), "/usr/bin/env");
        assert_eq!(signer.timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parse_defaults() {
        let config: Config = toml::from_str("[smime]\n").unwrap();
        assert!(config.smime.allowed_emails.is_empty());
        assert_eq!(config.smime.cert_dir, "/var/lib/zone-mta/smime-certs");
        assert_eq!(config.smime.bundle_extension, "p12");
        assert_eq!(config.smime.signer.command, ["openssl"]);
        assert!(config.smime.signer.extra_args.is_empty());
        assert_eq!(config.smime.signer.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.smime.signer.max_output_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn test_parse_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.smime.cert_dir, DEFAULT_CERT_DIR);
        assert!(!config
            .smime
            .policy()
            .evaluate("alice@example.com", Some("alice@example.com"))
            .is_eligible());
    }

    #[test]
    fn test_zero_timeout_disables_limit() {
        let config: Config = toml::from_str("[smime.signer]\ntimeout_secs = 0\n").unwrap();
        assert_eq!(config.smime.signer.timeout(), None);
        assert_eq!(config.smime.signer().timeout(), None);
    }

    #[test]
    fn test_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("smimegate.toml");
        fs::write(&path, "[smime]\nallowed_emails = [\"a@b.com\"]\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.smime.allowed_emails, ["a@b.com"]);
    }

    #[test]
    fn test_load_config_errors() {
        let temp_dir = TempDir::new().unwrap();
        let missing = load_config(&temp_dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));

        let path = temp_dir.path().join("broken.toml");
        fs::write(&path, "[smime\nallowed_emails = ").unwrap();
        let broken = load_config(&path);
        assert!(matches!(broken, Err(ConfigError::Parse(_))));
        assert!(broken.unwrap_err().to_string().starts_with("Config parse error"));
    }
}

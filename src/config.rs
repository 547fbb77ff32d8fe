//! Configuration types, built from environment variables.

use std::path::PathBuf;

use regex::Regex;
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::mail::link::LinkOptions;

/// Keys that must be present for the service to start.
const REQUIRED_KEYS: &[&str] = &["IMAP_USER", "IMAP_PASSWORD", "TARGET_SENDER"];

const DEFAULT_IMAP_HOST: &str = "imap.daum.net";
const DEFAULT_IMAP_PORT: u16 = 993;
const DEFAULT_MAILBOX: &str = "INBOX";
const DEFAULT_PAGE_URL: &str = "https://username.github.io/repo-name/";
const DEFAULT_MAX_PDFS: usize = 3;
const DEFAULT_BROWSER_BIN: &str = "chromium";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const DEFAULT_LOCALE: &str = "ko-KR";
const DEFAULT_TIMEZONE: &str = "Asia/Seoul";

/// Mailbox server connection settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: SecretString,
    pub tls: bool,
}

/// What to watch for and how to pick the link.
#[derive(Debug, Clone)]
pub struct MailConfig {
    /// Substring identifying the sender whose messages are processed.
    pub target_sender: String,
    pub mailbox: String,
    pub mark_as_read: bool,
    pub link: LinkOptions,
}

/// Static-site publishing settings.
#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub page_url: String,
    /// Directory holding `pdfs.json` and `pdfs/`, committed to git.
    pub publish_dir: PathBuf,
    pub max_pdfs: usize,
    pub git_push: bool,
}

/// Headless browser settings.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub bin: String,
    pub headless: bool,
    /// Persistent profile directory; keeps logins across restarts.
    pub session_dir: PathBuf,
    pub user_agent: String,
    pub locale: String,
    pub timezone: String,
    pub wait_for_selector: Option<String>,
}

/// Chat bot settings. Present only when both token and chat id are set.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub chat_id: String,
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub imap: ImapConfig,
    pub mail: MailConfig,
    pub publish: PublishConfig,
    pub browser: BrowserConfig,
    pub temp_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub telegram: Option<TelegramConfig>,
    /// Send a chat message when a dispatch cycle fails.
    pub notify_errors: bool,
}

impl Config {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    ///
    /// Every missing required key is reported at once; malformed values
    /// are reported by key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let missing: Vec<String> = REQUIRED_KEYS
            .iter()
            .filter(|&&key| get(key).is_none())
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingEnvVars(missing));
        }

        let port = match get("IMAP_PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|e| ConfigError::InvalidValue {
                key: "IMAP_PORT".into(),
                message: e.to_string(),
            })?,
            None => DEFAULT_IMAP_PORT,
        };

        let max_pdfs = match get("PUBLISH_MAX_PDFS") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                Ok(_) => {
                    return Err(ConfigError::InvalidValue {
                        key: "PUBLISH_MAX_PDFS".into(),
                        message: "must be at least 1".into(),
                    });
                }
                Err(e) => {
                    return Err(ConfigError::InvalidValue {
                        key: "PUBLISH_MAX_PDFS".into(),
                        message: e.to_string(),
                    });
                }
            },
            None => DEFAULT_MAX_PDFS,
        };

        let pattern = match get("LINK_PATTERN") {
            Some(raw) => Some(Regex::new(&raw).map_err(|e| ConfigError::InvalidValue {
                key: "LINK_PATTERN".into(),
                message: e.to_string(),
            })?),
            None => None,
        };

        let imap = ImapConfig {
            host: get("IMAP_HOST").unwrap_or_else(|| DEFAULT_IMAP_HOST.to_string()),
            port,
            user: get("IMAP_USER").unwrap_or_default(),
            password: SecretString::from(get("IMAP_PASSWORD").unwrap_or_default()),
            tls: parse_bool(&get, "IMAP_TLS", true)?,
        };

        let mail = MailConfig {
            target_sender: get("TARGET_SENDER").unwrap_or_default(),
            mailbox: get("MAILBOX").unwrap_or_else(|| DEFAULT_MAILBOX.to_string()),
            mark_as_read: parse_bool(&get, "MARK_AS_READ", true)?,
            link: LinkOptions {
                domain: get("LINK_DOMAIN"),
                pattern,
            },
        };

        let publish = PublishConfig {
            page_url: get("GITHUB_PAGE_URL").unwrap_or_else(|| DEFAULT_PAGE_URL.to_string()),
            publish_dir: get("PUBLISH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./docs")),
            max_pdfs,
            git_push: parse_bool(&get, "GIT_PUSH", true)?,
        };

        let browser = BrowserConfig {
            bin: get("BROWSER_BIN").unwrap_or_else(|| DEFAULT_BROWSER_BIN.to_string()),
            headless: parse_bool(&get, "BROWSER_HEADLESS", false)?,
            session_dir: get("SESSION_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sessions")),
            user_agent: get("BROWSER_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            locale: get("BROWSER_LOCALE").unwrap_or_else(|| DEFAULT_LOCALE.to_string()),
            timezone: get("BROWSER_TIMEZONE").unwrap_or_else(|| DEFAULT_TIMEZONE.to_string()),
            wait_for_selector: get("WAIT_FOR_SELECTOR"),
        };

        let telegram = match (get("TELEGRAM_BOT_TOKEN"), get("TELEGRAM_CHAT_ID")) {
            (Some(token), Some(chat_id)) => Some(TelegramConfig {
                bot_token: SecretString::from(token),
                chat_id,
            }),
            _ => None,
        };

        Ok(Self {
            imap,
            mail,
            publish,
            browser,
            temp_dir: get("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./temp")),
            logs_dir: get("LOGS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./logs")),
            telegram,
            notify_errors: parse_bool(&get, "NOTIFY_ERRORS", false)?,
        })
    }
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}

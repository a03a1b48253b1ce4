use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::time::Duration;

use crate::client::ClientConfig;

/// Earthdata deployment: catalog base URL and Earthdata Login host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct System {
    pub cmr_base_url: String,
    pub edl_hostname: String,
}

impl System {
    pub fn prod() -> Self {
        Self {
            cmr_base_url: "https://cmr.earthdata.nasa.gov".to_string(),
            edl_hostname: "urs.earthdata.nasa.gov".to_string(),
        }
    }

    pub fn uat() -> Self {
        Self {
            cmr_base_url: "https://cmr.uat.earthdata.nasa.gov".to_string(),
            edl_hostname: "uat.urs.earthdata.nasa.gov".to_string(),
        }
    }

    fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "prod" | "ops" | "production" => Ok(Self::prod()),
            "uat" => Ok(Self::uat()),
            other => bail!("unknown Earthdata environment `{}` (expected `prod` or `uat`)", other),
        }
    }
}

impl Default for System {
    fn default() -> Self {
        Self::prod()
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct NetrcEntry {
    login: Option<String>,
    password: Option<String>,
}

/// Explicit values win over the environment, which wins over `.netrc`.
pub(crate) fn load_config(
    token: Option<String>,
    username: Option<String>,
    password: Option<String>,
    verify: Option<bool>,
) -> Result<ClientConfig> {
    let system = match std::env::var("EARTHDATA_ENV") {
        Ok(name) if !name.trim().is_empty() => System::from_name(&name)?,
        _ => System::prod(),
    };

    let token = token.or_else(|| non_empty_env("EARTHDATA_TOKEN"));
    let mut username = username.or_else(|| non_empty_env("EARTHDATA_USERNAME"));
    let mut password = password.or_else(|| non_empty_env("EARTHDATA_PASSWORD"));

    if username.is_some() != password.is_some() && token.is_none() {
        bail!("EARTHDATA_USERNAME and EARTHDATA_PASSWORD must both be set (or set EARTHDATA_TOKEN)");
    }

    if token.is_none() && username.is_none() {
        for path in netrc_candidates() {
            if !path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if let Some(entry) = parse_netrc(&text, &system.edl_hostname) {
                match (entry.login, entry.password) {
                    (Some(l), Some(p)) => {
                        tracing::debug!(path = %path.display(), "using .netrc for Earthdata Login");
                        username = Some(l);
                        password = Some(p);
                    }
                    (None, _) => bail!("login not found for {} in {}", system.edl_hostname, path.display()),
                    (_, None) => bail!("password not found for {} in {}", system.edl_hostname, path.display()),
                }
            }
            break;
        }
    }

    let verify = match verify {
        Some(v) => v,
        None => match std::env::var("EARTHACCESS_VERIFY") {
            Ok(v) => !matches!(v.trim(), "0" | "false" | "no"),
            Err(_) => true,
        },
    };

    Ok(ClientConfig {
        system,
        token,
        username,
        password,
        verify,
        timeout: Duration::from_secs(60),
    })
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Finds the entry for `machine`, falling back to a `default` entry.
fn parse_netrc(text: &str, machine: &str) -> Option<NetrcEntry> {
    let mut tokens = text
        .lines()
        .filter(|l| !l.trim_start().starts_with('#'))
        .flat_map(str::split_whitespace)
        .map(strip_quotes);

    let mut found: Option<NetrcEntry> = None;
    let mut default: Option<NetrcEntry> = None;
    // Entry currently being filled: Some(true) = our machine, Some(false) = default.
    let mut current: Option<bool> = None;

    while let Some(tok) = tokens.next() {
        match tok {
            "machine" => {
                let name = tokens.next().unwrap_or("");
                if found.is_some() {
                    break;
                }
                current = if name == machine {
                    found = Some(NetrcEntry::default());
                    Some(true)
                } else {
                    None
                };
            }
            "default" => {
                if found.is_some() {
                    break;
                }
                default = Some(NetrcEntry::default());
                current = Some(false);
            }
            "login" | "password" | "account" => {
                let value = tokens.next().map(str::to_string);
                let entry = match current {
                    Some(true) => found.as_mut(),
                    Some(false) => default.as_mut(),
                    None => None,
                };
                if let Some(entry) = entry {
                    match tok {
                        "login" => entry.login = value,
                        "password" => entry.password = value,
                        _ => {}
                    }
                }
            }
            // Macro definitions run until a blank line; they never carry credentials we need.
            "macdef" => current = None,
            _ => {}
        }
    }

    found.or(default)
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn netrc_candidates() -> Vec<PathBuf> {
    // 1) NETRC (explicit)
    // 2) ./.netrc
    // 3) ~/.netrc (~/_netrc on Windows)
    if let Ok(p) = std::env::var("NETRC") {
        return vec![PathBuf::from(p)];
    }

    let name = if cfg!(windows) { "_netrc" } else { ".netrc" };
    let mut v = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        v.push(cwd.join(name));
    }
    if let Some(home) = dirs::home_dir() {
        v.push(home.join(name));
    }
    v
}

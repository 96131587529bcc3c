//! Connection string handling.
//!
//! Tenants configure Postgres with either URI syntax (`postgres://user@host/db?sslmode=disable`)
//! or libpq key/value syntax (`host=db user=app dbname=tenants`). Shared-schema tenants get
//! their `search_path` bound in the connection string itself, so every session opened from a
//! cached pool lands in the tenant's schema without callers doing anything.

use std::str::FromStr;

use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::{Error, Result, schema::fold_ident};

const SEARCH_PATH: &str = "search_path";

/// libpq client settings with no equivalent in the driver. Honouring them
/// silently would change how the connection is made, so they are refused.
const CLIENT_ONLY_KEYS: &[&str] = &[
    "channel_binding",
    "connect_timeout",
    "gssencmode",
    "gsslib",
    "keepalives",
    "keepalives_count",
    "keepalives_idle",
    "keepalives_interval",
    "krbsrvname",
    "load_balance_hosts",
    "passfile",
    "replication",
    "require_auth",
    "requirepeer",
    "service",
    "ssl_max_protocol_version",
    "ssl_min_protocol_version",
    "sslcertmode",
    "sslcompression",
    "sslcrl",
    "sslcrldir",
    "sslnegotiation",
    "sslpassword",
    "sslsni",
    "target_session_attrs",
    "tcp_user_timeout",
];

pub fn is_uri(dsn: &str) -> bool {
    let dsn = dsn.trim_start();
    dsn.starts_with("postgres://") || dsn.starts_with("postgresql://")
}

/// Bind the session's default schema to `schema`.
///
/// URI strings gain a `search_path` query parameter; key/value strings gain an
/// `options=-csearch_path=<schema>` runtime option. A string that already
/// selects `schema` is returned unchanged, and existing parameters are never
/// touched. A string that selects some other schema is a configuration error.
pub fn with_search_path(dsn: &str, schema: &str) -> Result<String> {
    let schema = schema.trim();
    if schema.is_empty() {
        return Ok(dsn.to_string());
    }
    if let Some(existing) = bound_search_path(dsn) {
        let leading = existing.split(',').next().map(unquote).unwrap_or_default();
        if leading != fold_ident(schema) {
            return Err(Error::Configuration(format!(
                "connection string selects search_path `{existing}`, not schema `{schema}`"
            )));
        }
        return Ok(dsn.to_string());
    }
    Ok(if is_uri(dsn) {
        let sep = match dsn.find('?') {
            None => "?",
            Some(_) if dsn.ends_with('?') || dsn.ends_with('&') => "",
            Some(_) => "&",
        };
        format!("{dsn}{sep}{SEARCH_PATH}={schema}")
    } else {
        let base = dsn.trim_end();
        if base.is_empty() {
            format!("options=-c{SEARCH_PATH}={schema}")
        } else {
            format!("{base} options=-c{SEARCH_PATH}={schema}")
        }
    })
}

/// The `search_path` a connection string already selects, if any.
pub fn bound_search_path(dsn: &str) -> Option<String> {
    let from_options = |raw: &str| {
        parse_runtime_options(raw)
            .ok()?
            .into_iter()
            .find(|(name, _)| name == SEARCH_PATH)
            .map(|(_, value)| value)
    };
    if is_uri(dsn) {
        let (_, query) = dsn.split_once('?')?;
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let value = percent_decode(value);
            match key {
                SEARCH_PATH => Some(value),
                "options" => from_options(&value),
                _ => None,
            }
        })
    } else {
        // unparsable strings are left for connect_options to report
        parse_key_values(dsn)
            .ok()?
            .into_iter()
            .find_map(|(key, value)| match key.as_str() {
                SEARCH_PATH => Some(value),
                "options" => from_options(&value),
                _ => None,
            })
    }
}

fn unquote(entry: &str) -> String {
    let entry = entry.trim();
    match entry.strip_prefix('"').and_then(|e| e.strip_suffix('"')) {
        Some(quoted) => quoted.replace("\"\"", "\""),
        None => fold_ident(entry),
    }
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let hex = bytes
            .get(i + 1..i + 3)
            .and_then(|h| std::str::from_utf8(h).ok())
            .and_then(|h| u8::from_str_radix(h, 16).ok());
        match (bytes[i], hex) {
            (b'%', Some(byte)) => {
                out.push(byte);
                i += 3;
            }
            (b'+', _) => {
                out.push(b' ');
                i += 1;
            }
            (byte, _) => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse either DSN syntax into driver options, honouring the `search_path`
/// binding added by [`with_search_path`].
pub fn connect_options(dsn: &str) -> Result<PgConnectOptions> {
    let dsn = dsn.trim();
    if dsn.is_empty() {
        return Err(Error::Configuration("connection string is empty".into()));
    }
    if is_uri(dsn) {
        uri_options(dsn)
    } else {
        key_value_options(dsn)
    }
}

fn uri_options(dsn: &str) -> Result<PgConnectOptions> {
    // sqlx ignores unknown URI parameters, so search_path is lifted out and
    // re-applied as a startup option.
    let (base, search_path) = match dsn.split_once('?') {
        None => (dsn.to_string(), None),
        Some((head, query)) => {
            let mut kept = Vec::new();
            let mut search_path = None;
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((SEARCH_PATH, value)) => search_path = Some(percent_decode(value)),
                    _ => kept.push(pair),
                }
            }
            if kept.is_empty() {
                (head.to_string(), search_path)
            } else {
                (format!("{head}?{}", kept.join("&")), search_path)
            }
        }
    };

    let mut opts = PgConnectOptions::from_str(&base)
        .map_err(|e| Error::Configuration(format!("malformed connection URI: {e}")))?;
    if let Some(schema) = search_path {
        opts = opts.options([(SEARCH_PATH, schema)]);
    }
    Ok(opts)
}

/// Keys the driver does not model and libpq does not reserve are server
/// settings, and travel as startup parameters.
fn key_value_options(dsn: &str) -> Result<PgConnectOptions> {
    let mut opts = PgConnectOptions::new_without_pgpass();
    let mut fallback_application_name = None;
    for (key, value) in parse_key_values(dsn)? {
        opts = match key.as_str() {
            "host" | "hostaddr" => opts.host(&value),
            "port" => opts.port(value.parse().map_err(|_| {
                Error::Configuration(format!("invalid port `{value}` in connection string"))
            })?),
            "dbname" => opts.database(&value),
            "user" => opts.username(&value),
            "password" => opts.password(&value),
            "application_name" => opts.application_name(&value),
            "sslmode" => opts.ssl_mode(PgSslMode::from_str(&value).map_err(|e| {
                Error::Configuration(format!("invalid sslmode `{value}`: {e}"))
            })?),
            "sslrootcert" => opts.ssl_root_cert(value.as_str()),
            "sslcert" => opts.ssl_client_cert(value.as_str()),
            "sslkey" => opts.ssl_client_key(value.as_str()),
            "options" => opts.options(parse_runtime_options(&value)?),
            "fallback_application_name" => {
                fallback_application_name = Some(value);
                opts
            }
            other if CLIENT_ONLY_KEYS.contains(&other) => {
                return Err(Error::Configuration(format!(
                    "connection parameter `{other}` is not supported"
                )));
            }
            other => {
                tracing::debug!(key = other, "passing connection parameter as a server setting");
                opts.options([(other, value.as_str())])
            }
        };
    }
    if let Some(name) = fallback_application_name {
        if opts.get_application_name().is_none() {
            opts = opts.application_name(&name);
        }
    }
    Ok(opts)
}

/// Split a libpq `key=value` string. Values may be single-quoted with `\'` and `\\` escapes.
pub(crate) fn parse_key_values(dsn: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = dsn.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            key.push(c);
            chars.next();
        }
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err(Error::Configuration(format!(
                "missing `=` after `{key}` in connection string"
            )));
        }
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'\'') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some(escaped) => value.push(escaped),
                        None => break,
                    },
                    '\'' => {
                        closed = true;
                        break;
                    }
                    c => value.push(c),
                }
            }
            if !closed {
                return Err(Error::Configuration(format!(
                    "unterminated quoted value for `{key}` in connection string"
                )));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        pairs.push((key, value));
    }

    Ok(pairs)
}

/// Decode `-c name=value` / `-cname=value` / `--name=value` runtime settings.
fn parse_runtime_options(raw: &str) -> Result<Vec<(String, String)>> {
    let mut settings = Vec::new();
    let mut tokens = raw.split_whitespace();
    while let Some(token) = tokens.next() {
        let setting = if token == "-c" {
            tokens.next().unwrap_or_default()
        } else if let Some(rest) = token.strip_prefix("--") {
            rest
        } else if let Some(rest) = token.strip_prefix("-c") {
            rest
        } else {
            return Err(Error::Configuration(format!(
                "unsupported runtime option `{token}`"
            )));
        };
        let (name, value) = setting.split_once('=').ok_or_else(|| {
            Error::Configuration(format!("runtime option `{setting}` has no value"))
        })?;
        settings.push((name.replace('-', "_"), value.to_string()));
    }
    Ok(settings)
}

//! Relation data codec.
//!
//! Converts between the platform's flat string key-value bags and the typed
//! descriptors the renderer works with. Key names follow the declared
//! interface contracts so that other charms can interoperate:
//!
//! | Interface | Keys |
//! |-----------|------|
//! | `grafana-datasource` | `name`, `type`, `url`, `access`, `isDefault` |
//! | `grafana-dash` | `title`, `dashboard`, `encoding` |
//! | `mysql` | `host`, `port`, `database` (alias `name`), `user`, `password`, `type`, `tls` |
//! | `ingress` | `url` |
//! | `grafana-peers` | `leader`, `fingerprint`, `ready`, `address`, `migrated-database` |
//!
//! Keys outside these sets are carried in each descriptor's `extra` map and
//! written back unchanged by [`encode`].

use base64::Engine;

use crate::error::DecodeError;
use crate::models::{
    AccessMode, DashboardDescriptor, DatabaseCredential, DatabaseDriver, DatasourceInfo,
    IngressInfo, InterfaceKind, PeerState, RawData,
};

pub mod keys {
    pub const NAME: &str = "name";
    pub const TYPE: &str = "type";
    pub const URL: &str = "url";
    pub const ACCESS: &str = "access";
    pub const IS_DEFAULT: &str = "isDefault";

    pub const TITLE: &str = "title";
    pub const DASHBOARD: &str = "dashboard";
    pub const ENCODING: &str = "encoding";

    pub const HOST: &str = "host";
    pub const PORT: &str = "port";
    pub const DATABASE: &str = "database";
    pub const USER: &str = "user";
    pub const PASSWORD: &str = "password";
    pub const TLS: &str = "tls";

    pub const LEADER: &str = "leader";
    pub const FINGERPRINT: &str = "fingerprint";
    pub const READY: &str = "ready";
    pub const ADDRESS: &str = "address";
    pub const MIGRATED_DATABASE: &str = "migrated-database";
}

/// A decoded relation entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedDescriptor {
    Datasource(DatasourceInfo),
    Dashboard(DashboardDescriptor),
    Database(DatabaseCredential),
    Ingress(IngressInfo),
    Peer(PeerState),
}

impl TypedDescriptor {
    pub fn kind(&self) -> InterfaceKind {
        match self {
            TypedDescriptor::Datasource(_) => InterfaceKind::Datasource,
            TypedDescriptor::Dashboard(_) => InterfaceKind::Dashboard,
            TypedDescriptor::Database(_) => InterfaceKind::Database,
            TypedDescriptor::Ingress(_) => InterfaceKind::Ingress,
            TypedDescriptor::Peer(_) => InterfaceKind::Peer,
        }
    }
}

/// Decode one unit's data bag on a relation of the given kind.
///
/// `unit` is the unit that wrote the bag; it becomes the descriptor's source
/// unit (or the peer's unit id).
pub fn decode(kind: InterfaceKind, unit: &str, raw: &RawData) -> Result<TypedDescriptor, DecodeError> {
    match kind {
        InterfaceKind::Datasource => decode_datasource(unit, raw).map(TypedDescriptor::Datasource),
        InterfaceKind::Dashboard => decode_dashboard(unit, raw).map(TypedDescriptor::Dashboard),
        InterfaceKind::Database => decode_database(raw).map(TypedDescriptor::Database),
        InterfaceKind::Ingress => decode_ingress(raw).map(TypedDescriptor::Ingress),
        InterfaceKind::Peer => decode_peer(unit, raw).map(TypedDescriptor::Peer),
    }
}

/// Encode a descriptor into a data bag. Never fails.
pub fn encode(desc: &TypedDescriptor) -> RawData {
    match desc {
        TypedDescriptor::Datasource(ds) => {
            let mut raw = ds.extra.clone();
            raw.insert(keys::NAME.into(), ds.name.clone());
            raw.insert(keys::TYPE.into(), ds.source_type.clone());
            raw.insert(keys::URL.into(), ds.url.clone());
            raw.insert(keys::ACCESS.into(), ds.access.as_str().into());
            raw.insert(keys::IS_DEFAULT.into(), ds.is_default.to_string());
            raw
        }
        TypedDescriptor::Dashboard(db) => {
            let mut raw = db.extra.clone();
            raw.insert(keys::TITLE.into(), db.title.clone());
            raw.insert(keys::DASHBOARD.into(), db.content.clone());
            raw
        }
        TypedDescriptor::Database(c) => {
            let mut raw = c.extra.clone();
            raw.insert(keys::TYPE.into(), c.driver.as_str().into());
            raw.insert(keys::HOST.into(), c.host.clone());
            raw.insert(keys::PORT.into(), c.port.to_string());
            raw.insert(keys::DATABASE.into(), c.database.clone());
            raw.insert(keys::USER.into(), c.user.clone());
            raw.insert(keys::PASSWORD.into(), c.password.clone());
            raw.insert(keys::TLS.into(), c.tls.to_string());
            raw
        }
        TypedDescriptor::Ingress(i) => {
            let mut raw = i.extra.clone();
            raw.insert(keys::URL.into(), i.url.clone());
            raw
        }
        TypedDescriptor::Peer(p) => {
            let mut raw = p.extra.clone();
            raw.insert(keys::LEADER.into(), p.leader.to_string());
            raw.insert(keys::READY.into(), p.ready.to_string());
            if let Some(fp) = &p.fingerprint {
                raw.insert(keys::FINGERPRINT.into(), fp.clone());
            }
            if let Some(addr) = &p.address {
                raw.insert(keys::ADDRESS.into(), addr.clone());
            }
            if let Some(m) = &p.migrated_database {
                raw.insert(keys::MIGRATED_DATABASE.into(), m.clone());
            }
            raw
        }
    }
}

fn decode_datasource(unit: &str, raw: &RawData) -> Result<DatasourceInfo, DecodeError> {
    let kind = InterfaceKind::Datasource;
    let name = required(raw, kind, keys::NAME)?;
    let source_type = required(raw, kind, keys::TYPE)?;
    let url = required(raw, kind, keys::URL)?;
    check_http_url(kind, keys::URL, &url)?;

    let access = match optional(raw, keys::ACCESS) {
        None => AccessMode::Proxy,
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "proxy" | "server" => AccessMode::Proxy,
            "direct" | "browser" => AccessMode::Direct,
            other => {
                return Err(DecodeError::Malformed {
                    kind,
                    field: keys::ACCESS,
                    reason: format!("expected proxy or direct, got '{}'", other),
                })
            }
        },
    };
    let is_default = optional_bool(raw, kind, keys::IS_DEFAULT)?.unwrap_or(false);

    Ok(DatasourceInfo {
        name,
        source_type,
        url,
        access,
        is_default,
        source_unit: unit.to_string(),
        extra: extra(raw, &[keys::NAME, keys::TYPE, keys::URL, keys::ACCESS, keys::IS_DEFAULT]),
    })
}

fn decode_dashboard(unit: &str, raw: &RawData) -> Result<DashboardDescriptor, DecodeError> {
    let kind = InterfaceKind::Dashboard;
    let title = required(raw, kind, keys::TITLE)?;
    let blob = required(raw, kind, keys::DASHBOARD)?;

    let content = match optional(raw, keys::ENCODING).map(|e| e.to_ascii_lowercase()) {
        None => blob,
        Some(e) if e == "json" || e == "raw" => blob,
        Some(e) if e == "base64" => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(blob.trim())
                .map_err(|err| DecodeError::Malformed {
                    kind,
                    field: keys::DASHBOARD,
                    reason: format!("invalid base64: {}", err),
                })?;
            String::from_utf8(bytes).map_err(|_| DecodeError::Malformed {
                kind,
                field: keys::DASHBOARD,
                reason: "decoded content is not UTF-8".to_string(),
            })?
        }
        Some(other) => {
            return Err(DecodeError::Malformed {
                kind,
                field: keys::ENCODING,
                reason: format!("unsupported encoding '{}'", other),
            })
        }
    };

    if let Err(err) = serde_json::from_str::<serde_json::Value>(&content) {
        return Err(DecodeError::Malformed {
            kind,
            field: keys::DASHBOARD,
            reason: format!("not valid JSON: {}", err),
        });
    }

    Ok(DashboardDescriptor {
        title,
        content,
        source_unit: unit.to_string(),
        extra: extra(raw, &[keys::TITLE, keys::DASHBOARD, keys::ENCODING]),
    })
}

fn decode_database(raw: &RawData) -> Result<DatabaseCredential, DecodeError> {
    let kind = InterfaceKind::Database;

    let driver = match optional(raw, keys::TYPE).map(|t| t.to_ascii_lowercase()) {
        None => DatabaseDriver::Mysql,
        Some(t) if t == "mysql" => DatabaseDriver::Mysql,
        Some(t) if t == "postgres" || t == "postgresql" => DatabaseDriver::Postgres,
        Some(other) => {
            return Err(DecodeError::Malformed {
                kind,
                field: keys::TYPE,
                reason: format!("unsupported database type '{}'", other),
            })
        }
    };

    let raw_host = required(raw, kind, keys::HOST)?;
    let (host, port) = match optional(raw, keys::PORT) {
        Some(p) => (raw_host, parse_port(kind, p)?),
        // Some providers publish "host:port" in a single key.
        None => match raw_host.rsplit_once(':') {
            Some((h, p)) if !h.is_empty() && !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) => {
                (h.to_string(), parse_port(kind, p)?)
            }
            _ => {
                return Err(DecodeError::MissingField {
                    kind,
                    field: keys::PORT,
                })
            }
        },
    };

    let database = match optional(raw, keys::DATABASE).or_else(|| optional(raw, keys::NAME)) {
        Some(d) => d.to_string(),
        None => {
            return Err(DecodeError::MissingField {
                kind,
                field: keys::DATABASE,
            })
        }
    };
    let user = required(raw, kind, keys::USER)?;
    let password = required(raw, kind, keys::PASSWORD)?;
    // Written inside an ini triple-quoted value.
    if password.contains("\"\"\"") || password.contains(['\n', '\r']) {
        return Err(DecodeError::Malformed {
            kind,
            field: keys::PASSWORD,
            reason: "contains a triple quote or a line break".to_string(),
        });
    }
    let tls = optional_bool(raw, kind, keys::TLS)?.unwrap_or(false);

    Ok(DatabaseCredential {
        driver,
        host,
        port,
        database,
        user,
        password,
        tls,
        extra: extra(
            raw,
            &[
                keys::TYPE,
                keys::HOST,
                keys::PORT,
                keys::DATABASE,
                keys::NAME,
                keys::USER,
                keys::PASSWORD,
                keys::TLS,
            ],
        ),
    })
}

fn decode_ingress(raw: &RawData) -> Result<IngressInfo, DecodeError> {
    let kind = InterfaceKind::Ingress;
    let url = required(raw, kind, keys::URL)?;
    check_http_url(kind, keys::URL, &url)?;
    Ok(IngressInfo {
        url,
        extra: extra(raw, &[keys::URL]),
    })
}

fn decode_peer(unit: &str, raw: &RawData) -> Result<PeerState, DecodeError> {
    let kind = InterfaceKind::Peer;
    Ok(PeerState {
        unit: unit.to_string(),
        leader: optional_bool(raw, kind, keys::LEADER)?.unwrap_or(false),
        fingerprint: optional(raw, keys::FINGERPRINT).map(str::to_string),
        ready: optional_bool(raw, kind, keys::READY)?.unwrap_or(false),
        address: optional(raw, keys::ADDRESS).map(str::to_string),
        migrated_database: optional(raw, keys::MIGRATED_DATABASE).map(str::to_string),
        extra: extra(
            raw,
            &[
                keys::LEADER,
                keys::FINGERPRINT,
                keys::READY,
                keys::ADDRESS,
                keys::MIGRATED_DATABASE,
            ],
        ),
    })
}

/// Present and non-blank.
fn optional<'a>(raw: &'a RawData, key: &str) -> Option<&'a str> {
    raw.get(key)
        .map(|v| v.as_str())
        .filter(|v| !v.trim().is_empty())
}

fn required(raw: &RawData, kind: InterfaceKind, field: &'static str) -> Result<String, DecodeError> {
    optional(raw, field)
        .map(str::to_string)
        .ok_or(DecodeError::MissingField { kind, field })
}

fn optional_bool(
    raw: &RawData,
    kind: InterfaceKind,
    field: &'static str,
) -> Result<Option<bool>, DecodeError> {
    match optional(raw, field) {
        None => Ok(None),
        Some(v) => match v.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Some(true)),
            "false" | "no" | "0" => Ok(Some(false)),
            other => Err(DecodeError::Malformed {
                kind,
                field,
                reason: format!("expected a boolean, got '{}'", other),
            }),
        },
    }
}

fn parse_port(kind: InterfaceKind, value: &str) -> Result<u16, DecodeError> {
    match value.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(DecodeError::Malformed {
            kind,
            field: keys::PORT,
            reason: format!("'{}' is not a valid port", value),
        }),
        Ok(p) => Ok(p),
    }
}

fn check_http_url(kind: InterfaceKind, field: &'static str, url: &str) -> Result<(), DecodeError> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    match rest {
        Some(r) if !r.is_empty() && !r.starts_with('/') => Ok(()),
        _ => Err(DecodeError::Malformed {
            kind,
            field,
            reason: format!("'{}' is not an http(s) URL", url),
        }),
    }
}

fn extra(raw: &RawData, known: &[&str]) -> RawData {
    raw.iter()
        .filter(|(k, _)| !known.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

use std::collections::{BTreeMap, BTreeSet};

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;
use url::Url;

use crate::config::ANNOTATION_PREFIX;

/// RFC 3986 unreserved characters stay literal inside agent option values.
const OPTION_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub const KEY_ENABLE: &str = "enable";
pub const KEY_DB_TYPES: &str = "db-types";
pub const KEY_COLLECTOR_TYPE: &str = "collector-type";
pub const KEY_COLLECTOR_ENDPOINT: &str = "collector-endpoint";
pub const KEY_SLOW_QUERY_THRESHOLD: &str = "slow-query-threshold";
pub const KEY_SAMPLING_RATE: &str = "sampling-rate";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid annotation {key}: {reason}")]
pub struct InvalidAnnotation {
    pub key: String,
    pub reason: String,
}

impl InvalidAnnotation {
    fn new(key: &str, reason: impl Into<String>) -> Self {
        Self {
            key: format!("{ANNOTATION_PREFIX}{key}"),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DbKind {
    MySql,
    PostgreSql,
    MariaDb,
    Oracle,
    SqlServer,
}

impl DbKind {
    pub const ALL: [DbKind; 5] = [
        DbKind::MySql,
        DbKind::PostgreSql,
        DbKind::MariaDb,
        DbKind::Oracle,
        DbKind::SqlServer,
    ];

    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "mysql" => Some(DbKind::MySql),
            "postgresql" | "postgres" => Some(DbKind::PostgreSql),
            "mariadb" => Some(DbKind::MariaDb),
            "oracle" => Some(DbKind::Oracle),
            "sqlserver" | "mssql" => Some(DbKind::SqlServer),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DbKind::MySql => "mysql",
            DbKind::PostgreSql => "postgresql",
            DbKind::MariaDb => "mariadb",
            DbKind::Oracle => "oracle",
            DbKind::SqlServer => "sqlserver",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectorKind {
    #[default]
    Logging,
    Memory,
    Jmx,
    Http,
    Composite,
}

impl CollectorKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "logging" => Some(CollectorKind::Logging),
            "memory" => Some(CollectorKind::Memory),
            "jmx" => Some(CollectorKind::Jmx),
            "http" => Some(CollectorKind::Http),
            "composite" => Some(CollectorKind::Composite),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CollectorKind::Logging => "logging",
            CollectorKind::Memory => "memory",
            CollectorKind::Jmx => "jmx",
            CollectorKind::Http => "http",
            CollectorKind::Composite => "composite",
        }
    }

    pub fn needs_endpoint(self) -> bool {
        matches!(self, CollectorKind::Http | CollectorKind::Composite)
    }
}

/// Fully-defaulted injection opt-in derived from a pod's annotation map.
#[derive(Debug, Clone)]
pub struct InjectionConfig {
    pub enabled: bool,
    pub db_kinds: BTreeSet<DbKind>,
    pub sampling_rate: f64,
    pub slow_query_threshold_ms: u32,
    pub collector_kind: CollectorKind,
    pub collector_endpoint: Option<Url>,
    pub extra_options: BTreeMap<String, String>,
    /// Explicitly-set options, in agent-argument order. Only what the user
    /// spelled out travels to the javaagent suffix.
    agent_args: Vec<(String, String)>,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            db_kinds: DbKind::ALL.into_iter().collect(),
            sampling_rate: 1.0,
            slow_query_threshold_ms: 1_000,
            collector_kind: CollectorKind::Logging,
            collector_endpoint: None,
            extra_options: BTreeMap::new(),
            agent_args: Vec::new(),
        }
    }
}

impl InjectionConfig {
    /// Comma-joined `key=value` suffix for `-javaagent:...=<suffix>`, values
    /// percent-encoded so the comma separation stays unambiguous.
    pub fn agent_option_string(&self) -> String {
        self.agent_args
            .iter()
            .map(|(key, value)| format!("{key}={}", utf8_percent_encode(value, OPTION_VALUE)))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug)]
pub struct ParsedAnnotations {
    pub config: InjectionConfig,
    pub warnings: Vec<String>,
}

/// Decodes the `kubedb.monitor/*` entries of a pod's annotation map.
///
/// Unknown prefixed keys are preserved verbatim; only values that cannot be
/// coerced produce an error, and the caller downgrades that to an admission
/// warning rather than a rejection.
pub fn parse_annotations(
    annotations: Option<&BTreeMap<String, String>>,
) -> Result<ParsedAnnotations, InvalidAnnotation> {
    let mut config = InjectionConfig::default();
    let mut warnings = Vec::new();
    let mut extras = Vec::new();

    let Some(annotations) = annotations else {
        return Ok(ParsedAnnotations { config, warnings });
    };

    let mut db_types_raw = None;
    let mut collector_type_raw = None;
    let mut endpoint_raw = None;
    let mut sampling_raw = None;
    let mut threshold_raw = None;

    for (key, value) in annotations {
        let Some(short) = key.strip_prefix(ANNOTATION_PREFIX) else {
            continue;
        };
        let value = value.trim();
        match short {
            KEY_ENABLE => {
                config.enabled = match value.to_ascii_lowercase().as_str() {
                    "true" => true,
                    "false" => false,
                    other => {
                        return Err(InvalidAnnotation::new(
                            KEY_ENABLE,
                            format!("expected true or false, got `{other}`"),
                        ))
                    }
                };
            }
            KEY_DB_TYPES => db_types_raw = Some(value.to_string()),
            KEY_COLLECTOR_TYPE => collector_type_raw = Some(value.to_string()),
            KEY_COLLECTOR_ENDPOINT => endpoint_raw = Some(value.to_string()),
            KEY_SAMPLING_RATE => sampling_raw = Some(value.to_string()),
            KEY_SLOW_QUERY_THRESHOLD => threshold_raw = Some(value.to_string()),
            other => extras.push((other.to_string(), value.to_string())),
        }
    }

    if let Some(raw) = &collector_type_raw {
        config.collector_kind = CollectorKind::parse(raw).ok_or_else(|| {
            InvalidAnnotation::new(KEY_COLLECTOR_TYPE, format!("unknown collector `{raw}`"))
        })?;
    }

    if let Some(raw) = &endpoint_raw {
        let url = Url::parse(raw)
            .map_err(|err| InvalidAnnotation::new(KEY_COLLECTOR_ENDPOINT, err.to_string()))?;
        config.collector_endpoint = Some(url);
    }

    if config.collector_kind.needs_endpoint() && config.collector_endpoint.is_none() {
        return Err(InvalidAnnotation::new(
            KEY_COLLECTOR_ENDPOINT,
            format!(
                "required when collector-type is {}",
                config.collector_kind.as_str()
            ),
        ));
    }

    if let Some(raw) = &db_types_raw {
        let mut kinds = BTreeSet::new();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if part.eq_ignore_ascii_case("all") {
                kinds.extend(DbKind::ALL);
                continue;
            }
            let kind = DbKind::parse(part).ok_or_else(|| {
                InvalidAnnotation::new(KEY_DB_TYPES, format!("unknown db type `{part}`"))
            })?;
            kinds.insert(kind);
        }
        if !kinds.is_empty() {
            config.db_kinds = kinds;
        }
    }

    if let Some(raw) = &sampling_raw {
        let rate: f64 = raw.parse().map_err(|_| {
            InvalidAnnotation::new(KEY_SAMPLING_RATE, format!("not a number: `{raw}`"))
        })?;
        if rate.is_nan() {
            return Err(InvalidAnnotation::new(KEY_SAMPLING_RATE, "NaN"));
        }
        config.sampling_rate = if (0.0..=1.0).contains(&rate) {
            rate
        } else {
            let clamped = rate.clamp(0.0, 1.0);
            warnings.push(format!(
                "{ANNOTATION_PREFIX}{KEY_SAMPLING_RATE}: {rate} outside [0,1], clamped to {clamped}"
            ));
            clamped
        };
    }

    if let Some(raw) = &threshold_raw {
        config.slow_query_threshold_ms = raw.parse().map_err(|_| {
            InvalidAnnotation::new(
                KEY_SLOW_QUERY_THRESHOLD,
                format!("not a millisecond count: `{raw}`"),
            )
        })?;
    }

    // Agent arguments mirror what was explicitly configured, in a stable
    // order, with normalized values.
    if collector_type_raw.is_some() {
        config
            .agent_args
            .push((KEY_COLLECTOR_TYPE.into(), config.collector_kind.as_str().into()));
    }
    if let Some(url) = &config.collector_endpoint {
        config
            .agent_args
            .push((KEY_COLLECTOR_ENDPOINT.into(), url.as_str().trim_end_matches('/').into()));
    }
    if db_types_raw.is_some() {
        let joined = config
            .db_kinds
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(",");
        config.agent_args.push((KEY_DB_TYPES.into(), joined));
    }
    if sampling_raw.is_some() {
        config
            .agent_args
            .push((KEY_SAMPLING_RATE.into(), config.sampling_rate.to_string()));
    }
    if threshold_raw.is_some() {
        config.agent_args.push((
            KEY_SLOW_QUERY_THRESHOLD.into(),
            config.slow_query_threshold_ms.to_string(),
        ));
    }
    for (key, value) in extras {
        config.extra_options.insert(key.clone(), value.clone());
        config.agent_args.push((key, value));
    }

    Ok(ParsedAnnotations { config, warnings })
}

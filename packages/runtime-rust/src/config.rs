//! Declarative runtime configuration.
//!
//! Deserializes from any serde format; the JSON shape is:
//!
//! ```json
//! {
//!   "default_bus": "default",
//!   "buses": { "default": { "middleware": ["tracing", "add_message_id"] } },
//!   "transports": {
//!     "async": { "dsn": "in-memory://", "options": { "pool_size": 4 },
//!                "retry": { "max_retries": 3, "delay_ms": 1000 } }
//!   },
//!   "routing": { "orders.place": "async" },
//!   "failure_transport": "failed"
//! }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

/// Name of the bus created when none is configured.
pub const DEFAULT_BUS_NAME: &str = "default";

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bus used for application dispatch and for unbound message types.
    pub default_bus: String,
    pub buses: BTreeMap<String, BusConfig>,
    pub transports: BTreeMap<String, TransportConfig>,
    /// Message name (registered, full Rust path, or bare type name) to
    /// transport name(s).
    pub routing: BTreeMap<String, RouteTarget>,
    /// Receives messages whose retries are exhausted.
    pub failure_transport: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let mut buses = BTreeMap::new();
        buses.insert(DEFAULT_BUS_NAME.to_string(), BusConfig::default());
        Self {
            default_bus: DEFAULT_BUS_NAME.to_string(),
            buses,
            transports: BTreeMap::new(),
            routing: BTreeMap::new(),
            failure_transport: None,
        }
    }
}

impl RuntimeConfig {
    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not match the configuration shape.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Middleware names, outermost first. The implicit tail is appended.
    pub middleware: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    pub dsn: String,
    /// Transport-specific options, interpreted by the factory.
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

/// One transport name or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RouteTarget {
    One(String),
    Many(Vec<String>),
}

impl RouteTarget {
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        match self {
            Self::One(name) => vec![name.clone()],
            Self::Many(names) => names.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

/// Parameters of the multiplier retry strategy.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delay_ms: u64,
    pub multiplier: f64,
    /// Upper bound on any single delay; `0` leaves delays uncapped.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 0,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

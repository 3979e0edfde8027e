//! Data - the structural value universe carried by the fabric
//!
//! Every published message and every store key/value is a `Data`. Equality
//! and ordering are structural, so `Data` can key ordered containers and be
//! compared across endpoints without any out-of-band schema.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// An `f64` with total ordering, so real values can live inside sets and
/// table keys.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Real(pub f64);

impl Eq for Real {}

impl PartialOrd for Real {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Real {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl From<f64> for Real {
    fn from(v: f64) -> Self {
        Real(v)
    }
}

/// Transport protocol tag for port values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Unknown,
    Tcp,
    Udp,
    Icmp,
}

/// A transport-layer port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Port {
    pub number: u16,
    pub protocol: Protocol,
}

/// An IP subnet (network address plus prefix length).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Subnet {
    pub network: IpAddr,
    pub length: u8,
}

/// A point in time, in microseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// The current wall-clock time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }

    pub const fn from_micros(micros: i64) -> Self {
        Timestamp(micros)
    }

    pub fn saturating_add(self, span: Span) -> Timestamp {
        Timestamp(self.0.saturating_add(span.0))
    }

    /// Time remaining until this instant, zero if already past.
    pub fn until(self) -> std::time::Duration {
        let now = Timestamp::now();
        std::time::Duration::from_micros(self.0.saturating_sub(now.0).max(0) as u64)
    }
}

/// A signed duration, in microseconds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Span(pub i64);

impl Span {
    pub const fn from_micros(micros: i64) -> Self {
        Span(micros)
    }

    pub const fn from_millis(millis: i64) -> Self {
        Span(millis * 1_000)
    }

    pub const fn from_secs(secs: i64) -> Self {
        Span(secs * 1_000_000)
    }
}

/// The tagged value sum. Ordering is structural: first by variant, then by
/// content, recursively.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Data {
    #[default]
    None,
    Bool(bool),
    Integer(i64),
    Count(u64),
    Real(Real),
    Text(String),
    Address(IpAddr),
    Subnet(Subnet),
    Port(Port),
    Timestamp(Timestamp),
    Span(Span),
    Enum(String),
    Set(BTreeSet<Data>),
    Table(BTreeMap<Data, Data>),
    Vector(Vec<Data>),
    Record(Vec<Data>),
}

impl Data {
    /// Human-readable tag name, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Data::None => "none",
            Data::Bool(_) => "bool",
            Data::Integer(_) => "integer",
            Data::Count(_) => "count",
            Data::Real(_) => "real",
            Data::Text(_) => "text",
            Data::Address(_) => "address",
            Data::Subnet(_) => "subnet",
            Data::Port(_) => "port",
            Data::Timestamp(_) => "timestamp",
            Data::Span(_) => "span",
            Data::Enum(_) => "enum",
            Data::Set(_) => "set",
            Data::Table(_) => "table",
            Data::Vector(_) => "vector",
            Data::Record(_) => "record",
        }
    }
}

impl From<bool> for Data {
    fn from(v: bool) -> Self {
        Data::Bool(v)
    }
}

impl From<i64> for Data {
    fn from(v: i64) -> Self {
        Data::Integer(v)
    }
}

impl From<u64> for Data {
    fn from(v: u64) -> Self {
        Data::Count(v)
    }
}

impl From<f64> for Data {
    fn from(v: f64) -> Self {
        Data::Real(Real(v))
    }
}

impl From<&str> for Data {
    fn from(v: &str) -> Self {
        Data::Text(v.to_string())
    }
}

impl From<String> for Data {
    fn from(v: String) -> Self {
        Data::Text(v)
    }
}

impl From<Vec<Data>> for Data {
    fn from(v: Vec<Data>) -> Self {
        Data::Vector(v)
    }
}

//! Polymorphic data values carried by publications and store entries.
//!
//! `Data` is a tagged union with a total order (tag index first, then value
//! order) so that values can key ordered maps and sets. Reals participate via
//! IEEE total ordering; hashing uses the bit pattern for consistency.

use crate::types::Timespan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    fmt,
    hash::{Hash, Hasher},
    net::IpAddr,
};

/// Transport protocol of a [`Port`] value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Protocol {
    /// Unknown or unspecified protocol
    #[default]
    Unknown,
    /// Transmission Control Protocol
    Tcp,
    /// User Datagram Protocol
    Udp,
    /// Internet Control Message Protocol
    Icmp,
}

impl Protocol {
    /// Wire tag of this protocol.
    pub const fn tag(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Tcp => 1,
            Self::Udp => 2,
            Self::Icmp => 3,
        }
    }

    /// Decode a wire tag.
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Unknown),
            1 => Some(Self::Tcp),
            2 => Some(Self::Udp),
            3 => Some(Self::Icmp),
            _ => None,
        }
    }
}

/// A transport-layer port with its protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Port {
    /// Port number
    pub number: u16,
    /// Transport protocol
    pub protocol: Protocol,
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            Protocol::Unknown => "?",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        };
        write!(f, "{}/{proto}", self.number)
    }
}

/// An IP subnet in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Subnet {
    /// Network address
    pub address: IpAddr,
    /// Prefix length in bits
    pub length: u8,
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.length)
    }
}

/// Discriminant of a [`Data`] value, used for type checks and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataKind {
    /// Absence of a value
    Nil,
    /// Boolean
    Bool,
    /// Unsigned 64-bit integer
    Count,
    /// Signed 64-bit integer
    Integer,
    /// IEEE double
    Real,
    /// UTF-8 string
    Str,
    /// IP address
    Address,
    /// IP subnet
    Subnet,
    /// Transport port
    Port,
    /// Point in time
    Timestamp,
    /// Span of time
    Timespan,
    /// Named enumeration value
    Enum,
    /// Ordered sequence of values
    Vector,
    /// Ordered set of values
    Set,
    /// Ordered value-to-value map
    Table,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Nil => "nil",
            Self::Bool => "bool",
            Self::Count => "count",
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Str => "string",
            Self::Address => "address",
            Self::Subnet => "subnet",
            Self::Port => "port",
            Self::Timestamp => "timestamp",
            Self::Timespan => "timespan",
            Self::Enum => "enum",
            Self::Vector => "vector",
            Self::Set => "set",
            Self::Table => "table",
        };
        write!(f, "{name}")
    }
}

/// Polymorphic broker value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Data {
    /// Absence of a value
    Nil,
    /// Boolean
    Bool(bool),
    /// Unsigned 64-bit integer
    Count(u64),
    /// Signed 64-bit integer
    Integer(i64),
    /// IEEE double
    Real(f64),
    /// UTF-8 string
    Str(String),
    /// IP address
    Address(IpAddr),
    /// IP subnet
    Subnet(Subnet),
    /// Transport port
    Port(Port),
    /// Point in time
    Timestamp(DateTime<Utc>),
    /// Span of time
    Timespan(Timespan),
    /// Named enumeration value
    Enum(String),
    /// Ordered sequence of values
    Vector(Vec<Data>),
    /// Ordered set of values
    Set(BTreeSet<Data>),
    /// Ordered value-to-value map
    Table(BTreeMap<Data, Data>),
}

impl Data {
    /// Wire tag and ordering rank of this value.
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Nil => 0,
            Self::Bool(_) => 1,
            Self::Count(_) => 2,
            Self::Integer(_) => 3,
            Self::Real(_) => 4,
            Self::Str(_) => 5,
            Self::Address(_) => 6,
            Self::Subnet(_) => 7,
            Self::Port(_) => 8,
            Self::Timestamp(_) => 9,
            Self::Timespan(_) => 10,
            Self::Enum(_) => 11,
            Self::Vector(_) => 12,
            Self::Set(_) => 13,
            Self::Table(_) => 14,
        }
    }

    /// Discriminant of this value.
    pub const fn kind(&self) -> DataKind {
        match self {
            Self::Nil => DataKind::Nil,
            Self::Bool(_) => DataKind::Bool,
            Self::Count(_) => DataKind::Count,
            Self::Integer(_) => DataKind::Integer,
            Self::Real(_) => DataKind::Real,
            Self::Str(_) => DataKind::Str,
            Self::Address(_) => DataKind::Address,
            Self::Subnet(_) => DataKind::Subnet,
            Self::Port(_) => DataKind::Port,
            Self::Timestamp(_) => DataKind::Timestamp,
            Self::Timespan(_) => DataKind::Timespan,
            Self::Enum(_) => DataKind::Enum,
            Self::Vector(_) => DataKind::Vector,
            Self::Set(_) => DataKind::Set,
            Self::Table(_) => DataKind::Table,
        }
    }

    /// View as a string slice, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Whether this is the nil value.
    pub const fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }
}

impl PartialEq for Data {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Data {}

impl Ord for Data {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.tag().cmp(&other.tag()) {
            Ordering::Equal => {},
            unequal => return unequal,
        }
        match (self, other) {
            (Self::Nil, Self::Nil) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Count(a), Self::Count(b)) => a.cmp(b),
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Real(a), Self::Real(b)) => a.total_cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Address(a), Self::Address(b)) => a.cmp(b),
            (Self::Subnet(a), Self::Subnet(b)) => a.cmp(b),
            (Self::Port(a), Self::Port(b)) => a.cmp(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            (Self::Timespan(a), Self::Timespan(b)) => a.cmp(b),
            (Self::Enum(a), Self::Enum(b)) => a.cmp(b),
            (Self::Vector(a), Self::Vector(b)) => a.cmp(b),
            (Self::Set(a), Self::Set(b)) => a.cmp(b),
            (Self::Table(a), Self::Table(b)) => a.cmp(b),
            _ => unreachable!("tag comparison already decided"),
        }
    }
}

impl PartialOrd for Data {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for Data {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.tag());
        match self {
            Self::Nil => {},
            Self::Bool(x) => x.hash(state),
            Self::Count(x) => x.hash(state),
            Self::Integer(x) => x.hash(state),
            Self::Real(x) => state.write_u64(x.to_bits()),
            Self::Str(x) => x.hash(state),
            Self::Address(x) => x.hash(state),
            Self::Subnet(x) => x.hash(state),
            Self::Port(x) => x.hash(state),
            Self::Timestamp(x) => x.hash(state),
            Self::Timespan(x) => x.hash(state),
            Self::Enum(x) => x.hash(state),
            Self::Vector(xs) => xs.hash(state),
            Self::Set(xs) => xs.hash(state),
            Self::Table(xs) => xs.hash(state),
        }
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "nil"),
            Self::Bool(x) => write!(f, "{x}"),
            Self::Count(x) => write!(f, "{x}"),
            Self::Integer(x) => write!(f, "{x}"),
            Self::Real(x) => write!(f, "{x}"),
            Self::Str(x) => write!(f, "{x:?}"),
            Self::Address(x) => write!(f, "{x}"),
            Self::Subnet(x) => write!(f, "{x}"),
            Self::Port(x) => write!(f, "{x}"),
            Self::Timestamp(x) => write!(f, "{x}"),
            Self::Timespan(x) => write!(f, "{x}"),
            Self::Enum(x) => write!(f, "{x}"),
            Self::Vector(xs) => {
                write!(f, "[")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{x}")?;
                }
                write!(f, "]")
            },
            Self::Set(xs) => {
                write!(f, "{{")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{x}")?;
                }
                write!(f, "}}")
            },
            Self::Table(xs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in xs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k} -> {v}")?;
                }
                write!(f, "}}")
            },
        }
    }
}

impl From<bool> for Data {
    fn from(x: bool) -> Self {
        Self::Bool(x)
    }
}

impl From<u64> for Data {
    fn from(x: u64) -> Self {
        Self::Count(x)
    }
}

impl From<i64> for Data {
    fn from(x: i64) -> Self {
        Self::Integer(x)
    }
}

impl From<f64> for Data {
    fn from(x: f64) -> Self {
        Self::Real(x)
    }
}

impl From<&str> for Data {
    fn from(x: &str) -> Self {
        Self::Str(x.to_string())
    }
}

impl From<String> for Data {
    fn from(x: String) -> Self {
        Self::Str(x)
    }
}

impl From<Vec<Data>> for Data {
    fn from(xs: Vec<Data>) -> Self {
        Self::Vector(xs)
    }
}

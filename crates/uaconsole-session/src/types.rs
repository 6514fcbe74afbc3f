// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Core data model shared by every session component.
//!
//! - **NodeId**: OPC UA node identifiers with parsing and formatting
//! - **NodeRef**: a discovered node, produced by the address-space walker
//! - **EndpointTarget**: where and how to connect
//! - **UaValue / DataValue / StatusCode**: values and per-element results
//!
//! # Examples
//!
//! ```
//! use uaconsole_session::types::{NodeId, EndpointTarget};
//!
//! let node: NodeId = "ns=3;s=Plant.Line1.Speed".parse().unwrap();
//! assert_eq!(node.namespace_index, 3);
//!
//! let target = EndpointTarget::new("opc.tcp://localhost:62541").with_security(false);
//! assert!(!target.uses_security());
//! ```

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigurationError, SessionError, SessionResult};

// =============================================================================
// NodeId
// =============================================================================

/// OPC UA Node Identifier.
///
/// A NodeId uniquely identifies a node within a server. It consists of a
/// namespace index and an identifier which can be numeric, string, GUID or
/// opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    /// Namespace index (0 = OPC UA standard namespace).
    pub namespace_index: u16,

    /// The node identifier.
    pub identifier: NodeIdentifier,
}

impl NodeId {
    /// Creates a numeric node ID.
    #[inline]
    pub fn numeric(namespace_index: u16, value: u32) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Numeric(value),
        }
    }

    /// Creates a string node ID.
    #[inline]
    pub fn string(namespace_index: u16, value: impl Into<String>) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::String(value.into()),
        }
    }

    /// Creates a GUID node ID.
    #[inline]
    pub fn guid(namespace_index: u16, value: Uuid) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Guid(value),
        }
    }

    /// Creates an opaque (byte string) node ID.
    #[inline]
    pub fn opaque(namespace_index: u16, value: Vec<u8>) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Opaque(value),
        }
    }

    // =========================================================================
    // Standard Node IDs
    // =========================================================================

    /// Root folder node (ns=0, i=84).
    pub const ROOT_FOLDER: NodeId = NodeId::standard(84);

    /// Objects folder node (ns=0, i=85).
    pub const OBJECTS_FOLDER: NodeId = NodeId::standard(85);

    /// Types folder node (ns=0, i=86).
    pub const TYPES_FOLDER: NodeId = NodeId::standard(86);

    /// Views folder node (ns=0, i=87).
    pub const VIEWS_FOLDER: NodeId = NodeId::standard(87);

    /// Server node (ns=0, i=2253).
    pub const SERVER: NodeId = NodeId::standard(2253);

    /// Server_ServerStatus (ns=0, i=2256).
    pub const SERVER_STATUS: NodeId = NodeId::standard(2256);

    /// Server_ServerStatus_CurrentTime (ns=0, i=2258).
    pub const SERVER_STATUS_CURRENT_TIME: NodeId = NodeId::standard(2258);

    /// Server_ServerStatus_State (ns=0, i=2259).
    pub const SERVER_STATUS_STATE: NodeId = NodeId::standard(2259);

    /// FolderType (ns=0, i=61).
    pub const FOLDER_TYPE: NodeId = NodeId::standard(61);

    /// BaseDataVariableType (ns=0, i=63).
    pub const BASE_DATA_VARIABLE_TYPE: NodeId = NodeId::standard(63);

    const fn standard(value: u32) -> Self {
        Self {
            namespace_index: 0,
            identifier: NodeIdentifier::Numeric(value),
        }
    }

    /// Returns the null node ID (ns=0, i=0).
    #[inline]
    pub const fn null() -> Self {
        Self::standard(0)
    }

    /// Returns `true` if this is a null node ID.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.namespace_index == 0 && matches!(self.identifier, NodeIdentifier::Numeric(0))
    }

    /// Returns `true` if this is in the standard namespace (ns=0).
    #[inline]
    pub const fn is_standard(&self) -> bool {
        self.namespace_index == 0
    }

    /// Converts to the OPC UA string format.
    ///
    /// ```
    /// use uaconsole_session::types::NodeId;
    ///
    /// assert_eq!(NodeId::numeric(2, 1001).to_opc_string(), "ns=2;i=1001");
    /// assert_eq!(NodeId::numeric(0, 85).to_opc_string(), "i=85");
    /// ```
    pub fn to_opc_string(&self) -> String {
        if self.namespace_index == 0 {
            self.identifier.to_string()
        } else {
            format!("ns={};{}", self.namespace_index, self.identifier)
        }
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_opc_string())
    }
}

impl FromStr for NodeId {
    type Err = SessionError;

    /// Parses `ns=2;i=1001`, `ns=2;s=Name`, `ns=2;g=<uuid>`, `ns=2;b=<base64>`
    /// or the same forms without the namespace prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |reason: String| SessionError::configuration(ConfigurationError::invalid_node_id(s, reason));

        let (namespace_index, identifier_part) = match s.strip_prefix("ns=") {
            Some(rest) => {
                let (ns, id) = rest
                    .split_once(';')
                    .ok_or_else(|| invalid("missing identifier after namespace".into()))?;
                let ns: u16 = ns
                    .parse()
                    .map_err(|_| invalid("invalid namespace index".into()))?;
                (ns, id)
            }
            None => (0, s),
        };

        let identifier = if let Some(id) = identifier_part.strip_prefix("i=") {
            NodeIdentifier::Numeric(
                id.parse()
                    .map_err(|_| invalid("invalid numeric identifier".into()))?,
            )
        } else if let Some(id) = identifier_part.strip_prefix("s=") {
            NodeIdentifier::String(id.to_string())
        } else if let Some(id) = identifier_part.strip_prefix("g=") {
            NodeIdentifier::Guid(
                Uuid::parse_str(id).map_err(|e| invalid(format!("invalid GUID: {e}")))?,
            )
        } else if let Some(id) = identifier_part.strip_prefix("b=") {
            NodeIdentifier::Opaque(
                BASE64
                    .decode(id)
                    .map_err(|e| invalid(format!("invalid base64: {e}")))?,
            )
        } else {
            return Err(invalid(
                "unknown identifier type, expected i=, s=, g= or b=".into(),
            ));
        };

        Ok(Self {
            namespace_index,
            identifier,
        })
    }
}

// =============================================================================
// NodeIdentifier
// =============================================================================

/// The four OPC UA identifier kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum NodeIdentifier {
    /// Numeric identifier.
    Numeric(u32),
    /// String identifier.
    String(String),
    /// GUID identifier.
    Guid(Uuid),
    /// Opaque identifier.
    Opaque(Vec<u8>),
}

impl fmt::Display for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(v) => write!(f, "i={v}"),
            Self::String(v) => write!(f, "s={v}"),
            Self::Guid(v) => write!(f, "g={v}"),
            Self::Opaque(v) => write!(f, "b={}", BASE64.encode(v)),
        }
    }
}

// =============================================================================
// NodeClass
// =============================================================================

/// OPC UA node classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeClass {
    /// Object node.
    Object,
    /// Variable node.
    Variable,
    /// Method node.
    Method,
    /// Object type node.
    ObjectType,
    /// Variable type node.
    VariableType,
    /// Reference type node.
    ReferenceType,
    /// Data type node.
    DataType,
    /// View node.
    View,
}

impl NodeClass {
    /// Returns the OPC UA bit mask value.
    pub const fn value(&self) -> u32 {
        match self {
            Self::Object => 1,
            Self::Variable => 2,
            Self::Method => 4,
            Self::ObjectType => 8,
            Self::VariableType => 16,
            Self::ReferenceType => 32,
            Self::DataType => 64,
            Self::View => 128,
        }
    }

    /// Creates from OPC UA value.
    pub fn from_value(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Object),
            2 => Some(Self::Variable),
            4 => Some(Self::Method),
            8 => Some(Self::ObjectType),
            16 => Some(Self::VariableType),
            32 => Some(Self::ReferenceType),
            64 => Some(Self::DataType),
            128 => Some(Self::View),
            _ => None,
        }
    }
}

impl fmt::Display for NodeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Object => "Object",
            Self::Variable => "Variable",
            Self::Method => "Method",
            Self::ObjectType => "ObjectType",
            Self::VariableType => "VariableType",
            Self::ReferenceType => "ReferenceType",
            Self::DataType => "DataType",
            Self::View => "View",
        };
        f.write_str(name)
    }
}

// =============================================================================
// NodeRef
// =============================================================================

/// A node discovered in the remote address space.
///
/// Produced by the address-space walker and read-only downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    /// Node identifier.
    pub node_id: NodeId,
    /// Node class.
    pub node_class: NodeClass,
    /// Browse name.
    pub browse_name: String,
    /// Display name.
    pub display_name: String,
    /// Type definition, when the server reported one.
    pub type_definition: Option<NodeId>,
    /// Data type of a variable, when known (node cache snapshots only).
    pub data_type: Option<NodeId>,
}

impl NodeRef {
    /// Creates a node reference with no type information.
    pub fn new(node_id: NodeId, node_class: NodeClass, browse_name: impl Into<String>) -> Self {
        let browse_name = browse_name.into();
        Self {
            node_id,
            node_class,
            display_name: browse_name.clone(),
            browse_name,
            type_definition: None,
            data_type: None,
        }
    }

    /// Sets the type definition.
    pub fn with_type_definition(mut self, type_definition: NodeId) -> Self {
        self.type_definition = Some(type_definition);
        self
    }

    /// Sets the data type.
    pub fn with_data_type(mut self, data_type: NodeId) -> Self {
        self.data_type = Some(data_type);
        self
    }

    /// Namespace index of the node itself.
    #[inline]
    pub fn namespace_index(&self) -> u16 {
        self.node_id.namespace_index
    }

    /// Returns `true` for variable nodes.
    #[inline]
    pub fn is_variable(&self) -> bool {
        self.node_class == NodeClass::Variable
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.node_id, self.browse_name, self.node_class)
    }
}

// =============================================================================
// SecurityMode / EndpointTarget
// =============================================================================

/// Message security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// No security.
    #[default]
    None,
    /// Messages are signed.
    Sign,
    /// Messages are signed and encrypted.
    SignAndEncrypt,
}

impl SecurityMode {
    /// Returns the display name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Sign => "Sign",
            Self::SignAndEncrypt => "SignAndEncrypt",
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SecurityMode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "none" => Ok(Self::None),
            "sign" => Ok(Self::Sign),
            "signandencrypt" => Ok(Self::SignAndEncrypt),
            _ => Err(SessionError::configuration(ConfigurationError::invalid_value(
                "security_mode",
                format!("unknown security mode '{s}'"),
            ))),
        }
    }
}

/// Where and how to connect.
///
/// Immutable once built; the controller keeps its own copy for the lifetime
/// of a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointTarget {
    url: String,
    security_mode: SecurityMode,
    use_security: bool,
}

impl EndpointTarget {
    /// Creates a target using the most secure mode.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            security_mode: SecurityMode::SignAndEncrypt,
            use_security: true,
        }
    }

    /// Enables or disables security.
    ///
    /// Disabling security forces [`SecurityMode::None`].
    pub fn with_security(mut self, use_security: bool) -> Self {
        self.use_security = use_security;
        self.security_mode = if use_security {
            SecurityMode::SignAndEncrypt
        } else {
            SecurityMode::None
        };
        self
    }

    /// Overrides the security mode.
    pub fn with_security_mode(mut self, mode: SecurityMode) -> Self {
        self.security_mode = mode;
        self.use_security = mode != SecurityMode::None;
        self
    }

    /// Endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Requested security mode.
    pub fn security_mode(&self) -> SecurityMode {
        self.security_mode
    }

    /// Whether security is requested.
    pub fn uses_security(&self) -> bool {
        self.use_security
    }

    /// Validates the URL scheme.
    pub fn validate(&self) -> SessionResult<()> {
        if !self.url.starts_with("opc.tcp://") {
            return Err(ConfigurationError::invalid_endpoint(
                &self.url,
                "URL must start with 'opc.tcp://'",
            )
            .into());
        }
        if self.url.len() <= "opc.tcp://".len() {
            return Err(ConfigurationError::invalid_endpoint(&self.url, "missing host").into());
        }
        Ok(())
    }
}

impl fmt::Display for EndpointTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.url, self.security_mode)
    }
}

// =============================================================================
// StatusCode
// =============================================================================

/// OPC UA status code.
///
/// The top two bits carry the severity: `00` good, `01` uncertain, `10` bad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

impl StatusCode {
    /// Good.
    pub const GOOD: Self = Self(0x0000_0000);
    /// Uncertain, initial value.
    pub const UNCERTAIN_INITIAL_VALUE: Self = Self(0x4092_0000);
    /// Unexpected error.
    pub const BAD_UNEXPECTED_ERROR: Self = Self(0x8001_0000);
    /// Communication error.
    pub const BAD_COMMUNICATION_ERROR: Self = Self(0x8005_0000);
    /// Timeout.
    pub const BAD_TIMEOUT: Self = Self(0x800A_0000);
    /// Nothing to do.
    pub const BAD_NOTHING_TO_DO: Self = Self(0x800F_0000);
    /// Too many operations.
    pub const BAD_TOO_MANY_OPERATIONS: Self = Self(0x8010_0000);
    /// User access denied.
    pub const BAD_USER_ACCESS_DENIED: Self = Self(0x801F_0000);
    /// Session closed.
    pub const BAD_SESSION_CLOSED: Self = Self(0x8026_0000);
    /// Subscription id invalid.
    pub const BAD_SUBSCRIPTION_ID_INVALID: Self = Self(0x8028_0000);
    /// Node id unknown.
    pub const BAD_NODE_ID_UNKNOWN: Self = Self(0x8034_0000);
    /// Attribute id invalid.
    pub const BAD_ATTRIBUTE_ID_INVALID: Self = Self(0x8035_0000);
    /// Not writable.
    pub const BAD_NOT_WRITABLE: Self = Self(0x803B_0000);
    /// Type mismatch.
    pub const BAD_TYPE_MISMATCH: Self = Self(0x8074_0000);
    /// Method invalid.
    pub const BAD_METHOD_INVALID: Self = Self(0x8075_0000);
    /// Arguments missing.
    pub const BAD_ARGUMENTS_MISSING: Self = Self(0x8076_0000);
    /// Not connected.
    pub const BAD_NOT_CONNECTED: Self = Self(0x808A_0000);
    /// Invalid argument.
    pub const BAD_INVALID_ARGUMENT: Self = Self(0x80AB_0000);
    /// Too many subscriptions.
    pub const BAD_TOO_MANY_SUBSCRIPTIONS: Self = Self(0x8077_0000);
    /// Too many monitored items.
    pub const BAD_TOO_MANY_MONITORED_ITEMS: Self = Self(0x80DB_0000);

    /// Returns `true` for good codes.
    #[inline]
    pub const fn is_good(&self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    /// Returns `true` for uncertain codes.
    #[inline]
    pub const fn is_uncertain(&self) -> bool {
        self.0 & 0xC000_0000 == 0x4000_0000
    }

    /// Returns `true` for bad codes.
    #[inline]
    pub const fn is_bad(&self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// Returns the symbolic name for well-known codes.
    pub fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Self::GOOD => "Good",
            Self::UNCERTAIN_INITIAL_VALUE => "UncertainInitialValue",
            Self::BAD_UNEXPECTED_ERROR => "BadUnexpectedError",
            Self::BAD_COMMUNICATION_ERROR => "BadCommunicationError",
            Self::BAD_TIMEOUT => "BadTimeout",
            Self::BAD_NOTHING_TO_DO => "BadNothingToDo",
            Self::BAD_TOO_MANY_OPERATIONS => "BadTooManyOperations",
            Self::BAD_USER_ACCESS_DENIED => "BadUserAccessDenied",
            Self::BAD_SESSION_CLOSED => "BadSessionClosed",
            Self::BAD_SUBSCRIPTION_ID_INVALID => "BadSubscriptionIdInvalid",
            Self::BAD_NODE_ID_UNKNOWN => "BadNodeIdUnknown",
            Self::BAD_ATTRIBUTE_ID_INVALID => "BadAttributeIdInvalid",
            Self::BAD_NOT_WRITABLE => "BadNotWritable",
            Self::BAD_TYPE_MISMATCH => "BadTypeMismatch",
            Self::BAD_METHOD_INVALID => "BadMethodInvalid",
            Self::BAD_ARGUMENTS_MISSING => "BadArgumentsMissing",
            Self::BAD_NOT_CONNECTED => "BadNotConnected",
            Self::BAD_INVALID_ARGUMENT => "BadInvalidArgument",
            Self::BAD_TOO_MANY_SUBSCRIPTIONS => "BadTooManySubscriptions",
            Self::BAD_TOO_MANY_MONITORED_ITEMS => "BadTooManyMonitoredItems",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} (0x{:08X})", self.0),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

// =============================================================================
// UaValue
// =============================================================================

/// A value read from, written to or published by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UaValue {
    /// Boolean.
    Boolean(bool),
    /// Signed 32-bit integer.
    Int32(i32),
    /// Unsigned 32-bit integer.
    UInt32(u32),
    /// Signed 64-bit integer.
    Int64(i64),
    /// Unsigned 64-bit integer.
    UInt64(u64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// UTC timestamp.
    DateTime(DateTime<Utc>),
    /// Raw bytes.
    ByteString(Vec<u8>),
    /// One-dimensional array.
    Array(Vec<UaValue>),
    /// No value.
    Null,
}

impl UaValue {
    /// Returns the built-in type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Boolean(_) => "Boolean",
            Self::Int32(_) => "Int32",
            Self::UInt32(_) => "UInt32",
            Self::Int64(_) => "Int64",
            Self::UInt64(_) => "UInt64",
            Self::Float(_) => "Float",
            Self::Double(_) => "Double",
            Self::String(_) => "String",
            Self::DateTime(_) => "DateTime",
            Self::ByteString(_) => "ByteString",
            Self::Array(_) => "Array",
            Self::Null => "Null",
        }
    }

    /// Returns `true` if both values carry the same built-in type.
    pub fn same_type(&self, other: &UaValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Converts to f64 if numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int32(v) => Some(*v as f64),
            Self::UInt32(v) => Some(*v as f64),
            Self::Int64(v) => Some(*v as f64),
            Self::UInt64(v) => Some(*v as f64),
            Self::Float(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for UaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::UInt32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v}"),
            Self::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            Self::ByteString(v) => write!(f, "{}", BASE64.encode(v)),
            Self::Array(values) => {
                f.write_str("[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
            Self::Null => f.write_str("null"),
        }
    }
}

// =============================================================================
// DataValue
// =============================================================================

/// A value together with its status and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataValue {
    /// The value, absent for bad results.
    pub value: Option<UaValue>,
    /// Status code.
    pub status: StatusCode,
    /// Source timestamp.
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Server timestamp.
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl DataValue {
    /// A good value stamped now.
    pub fn good(value: UaValue) -> Self {
        let now = Utc::now();
        Self {
            value: Some(value),
            status: StatusCode::GOOD,
            source_timestamp: Some(now),
            server_timestamp: Some(now),
        }
    }

    /// A value-less result carrying only a status.
    pub fn bad(status: StatusCode) -> Self {
        Self {
            value: None,
            status,
            source_timestamp: None,
            server_timestamp: Some(Utc::now()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_parse() {
        let node: NodeId = "ns=2;i=1001".parse().unwrap();
        assert_eq!(node, NodeId::numeric(2, 1001));

        let node: NodeId = "ns=3;s=\"ItemsTest\".\"Items\"".parse().unwrap();
        assert_eq!(node, NodeId::string(3, "\"ItemsTest\".\"Items\""));

        let node: NodeId = "i=85".parse().unwrap();
        assert_eq!(node, NodeId::OBJECTS_FOLDER);

        let node: NodeId = "ns=1;b=SGVsbG8=".parse().unwrap();
        assert_eq!(node, NodeId::opaque(1, b"Hello".to_vec()));

        assert!("ns=x;i=1".parse::<NodeId>().is_err());
        assert!("ns=2".parse::<NodeId>().is_err());
        assert!("ns=2;q=1".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_node_id_display() {
        assert_eq!(NodeId::string(2, "Demo").to_string(), "ns=2;s=Demo");
        assert_eq!(NodeId::ROOT_FOLDER.to_string(), "i=84");
        assert!(NodeId::null().is_null());
    }

    #[test]
    fn test_node_class_values() {
        for class in [NodeClass::Object, NodeClass::Variable, NodeClass::Method, NodeClass::View] {
            assert_eq!(NodeClass::from_value(class.value()), Some(class));
        }
        assert_eq!(NodeClass::from_value(3), None);
    }

    #[test]
    fn test_endpoint_target() {
        let target = EndpointTarget::new("opc.tcp://localhost:62541/Quickstarts/ReferenceServer");
        assert!(target.uses_security());
        assert_eq!(target.security_mode(), SecurityMode::SignAndEncrypt);
        assert!(target.validate().is_ok());

        let target = target.with_security(false);
        assert_eq!(target.security_mode(), SecurityMode::None);

        assert!(EndpointTarget::new("http://localhost").validate().is_err());
        assert!(EndpointTarget::new("opc.tcp://").validate().is_err());
    }

    #[test]
    fn test_security_mode_parse() {
        assert_eq!("sign-and-encrypt".parse::<SecurityMode>().unwrap(), SecurityMode::SignAndEncrypt);
        assert_eq!("None".parse::<SecurityMode>().unwrap(), SecurityMode::None);
        assert!("aes".parse::<SecurityMode>().is_err());
    }

    #[test]
    fn test_status_code_classes() {
        assert!(StatusCode::GOOD.is_good());
        assert!(StatusCode::UNCERTAIN_INITIAL_VALUE.is_uncertain());
        assert!(StatusCode::BAD_NODE_ID_UNKNOWN.is_bad());
        assert!(!StatusCode::BAD_NODE_ID_UNKNOWN.is_good());
        assert_eq!(
            StatusCode::BAD_NOT_WRITABLE.to_string(),
            "BadNotWritable (0x803B0000)"
        );
        assert_eq!(StatusCode(0x8123_0000).to_string(), "0x81230000");
    }

    #[test]
    fn test_value_types() {
        assert!(UaValue::Double(1.0).same_type(&UaValue::Double(2.0)));
        assert!(!UaValue::Double(1.0).same_type(&UaValue::Int32(2)));
        assert_eq!(UaValue::Int32(4).as_f64(), Some(4.0));
        assert_eq!(
            UaValue::Array(vec![UaValue::Int32(1), UaValue::Int32(2)]).to_string(),
            "[1, 2]"
        );
    }

    #[test]
    fn test_node_ref_namespace() {
        let node = NodeRef::new(NodeId::string(3, "Speed"), NodeClass::Variable, "Speed")
            .with_type_definition(NodeId::numeric(2, 1001));
        assert_eq!(node.namespace_index(), 3);
        assert!(node.is_variable());
        assert_eq!(node.display_name, "Speed");
    }
}

//! Resource identity: name, classification and traffic direction.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of a protected resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    #[default]
    Common,
    Web,
    Rpc,
    ApiGateway,
    DbSql,
    Cache,
    Mq,
}

/// Direction of the gated traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrafficType {
    Inbound,
    #[default]
    Outbound,
}

impl fmt::Display for TrafficType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => write!(f, "Inbound"),
            Self::Outbound => write!(f, "Outbound"),
        }
    }
}

/// A named, classified unit of work gated by the library.
///
/// Created lazily on first reference; never destroyed during the process
/// lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceWrapper {
    name: String,
    classification: ResourceType,
    flow_type: TrafficType,
}

impl ResourceWrapper {
    pub fn new(name: String, classification: ResourceType, flow_type: TrafficType) -> Self {
        Self { name, classification, flow_type }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn classification(&self) -> ResourceType {
        self.classification
    }

    pub fn flow_type(&self) -> TrafficType {
        self.flow_type
    }
}

impl fmt::Display for ResourceWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResourceWrapper{{name={}, flowType={}, classification={:?}}}",
            self.name, self.flow_type, self.classification
        )
    }
}

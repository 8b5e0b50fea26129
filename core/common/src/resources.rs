//! Typed reference entities mirrored from the PCE.

use serde::{Deserialize, Serialize};

use crate::types::EntityKind;

/// A managed or unmanaged workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub id: String,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub description: Option<String>,
    pub public_ip: Option<String>,
    pub online: bool,
    pub os_detail: Option<String>,
    pub enforcement_mode: Option<String>,
    /// Identifiers of the labels attached to the workload.
    #[serde(default)]
    pub labels: Vec<String>,
}

/// A key/value label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub key: String,
    pub value: String,
}

/// One range of an IP list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpRange {
    pub from_ip: String,
    pub to_ip: Option<String>,
    #[serde(default)]
    pub exclusion: bool,
}

/// A named list of IP ranges and FQDNs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpList {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub ip_ranges: Vec<IpRange>,
    #[serde(default)]
    pub fqdns: Vec<String>,
}

/// Port/protocol tuple of a service. `proto` is the IANA protocol number;
/// built-in services such as "All Services" use `-1` for any protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub port: Option<i32>,
    pub to_port: Option<i32>,
    pub proto: Option<i32>,
}

/// A named service definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub service_ports: Vec<ServicePort>,
}

/// A group of labels sharing one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelGroup {
    pub id: String,
    pub name: String,
    pub key: Option<String>,
    pub description: Option<String>,
    /// Identifiers of the member labels.
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Any reference entity, tagged with its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    Workload(Workload),
    Label(Label),
    IpList(IpList),
    Service(Service),
    LabelGroup(LabelGroup),
}

impl Resource {
    /// Entity type of the record.
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Workload(_) => EntityKind::Workload,
            Self::Label(_) => EntityKind::Label,
            Self::IpList(_) => EntityKind::IpList,
            Self::Service(_) => EntityKind::Service,
            Self::LabelGroup(_) => EntityKind::LabelGroup,
        }
    }

    /// Remote-assigned stable identifier.
    pub fn id(&self) -> &str {
        match self {
            Self::Workload(w) => &w.id,
            Self::Label(l) => &l.id,
            Self::IpList(i) => &i.id,
            Self::Service(s) => &s.id,
            Self::LabelGroup(g) => &g.id,
        }
    }

    /// Human-readable name, used for the indexed `name` column.
    pub fn display_name(&self) -> Option<&str> {
        match self {
            Self::Workload(w) => w.name.as_deref().or(w.hostname.as_deref()),
            Self::Label(l) => Some(&l.value),
            Self::IpList(i) => Some(&i.name),
            Self::Service(s) => Some(&s.name),
            Self::LabelGroup(g) => Some(&g.name),
        }
    }
}

impl From<Workload> for Resource {
    fn from(value: Workload) -> Self {
        Self::Workload(value)
    }
}

impl From<Label> for Resource {
    fn from(value: Label) -> Self {
        Self::Label(value)
    }
}

impl From<IpList> for Resource {
    fn from(value: IpList) -> Self {
        Self::IpList(value)
    }
}

impl From<Service> for Resource {
    fn from(value: Service) -> Self {
        Self::Service(value)
    }
}

impl From<LabelGroup> for Resource {
    fn from(value: LabelGroup) -> Self {
        Self::LabelGroup(value)
    }
}

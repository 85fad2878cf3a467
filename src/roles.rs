//! Role and capability gating.
//!
//! Roles are a closed set and each role's capabilities come from a single
//! table, so client-side gating cannot drift from one screen to another.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum Role {
    Admin,
    Manager,
    Operator,
    Viewer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    ViewLiveFeed,
    RunDetection,
    ViewViolations,
    AcknowledgeViolations,
    ExportReports,
    ManageCameras,
    ManageDomains,
    ManageUsers,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::ViewLiveFeed,
        Capability::RunDetection,
        Capability::ViewViolations,
        Capability::AcknowledgeViolations,
        Capability::ExportReports,
        Capability::ManageCameras,
        Capability::ManageDomains,
        Capability::ManageUsers,
    ];
}

const ADMIN_CAPS: &[Capability] = &Capability::ALL;

const MANAGER_CAPS: &[Capability] = &[
    Capability::ViewLiveFeed,
    Capability::RunDetection,
    Capability::ViewViolations,
    Capability::AcknowledgeViolations,
    Capability::ExportReports,
    Capability::ManageCameras,
];

const OPERATOR_CAPS: &[Capability] = &[
    Capability::ViewLiveFeed,
    Capability::RunDetection,
    Capability::ViewViolations,
    Capability::AcknowledgeViolations,
];

const VIEWER_CAPS: &[Capability] = &[Capability::ViewLiveFeed, Capability::ViewViolations];

const ROLE_TABLE: &[(Role, &[Capability])] = &[
    (Role::Admin, ADMIN_CAPS),
    (Role::Manager, MANAGER_CAPS),
    (Role::Operator, OPERATOR_CAPS),
    (Role::Viewer, VIEWER_CAPS),
];

impl Role {
    pub fn capabilities(self) -> &'static [Capability] {
        ROLE_TABLE
            .iter()
            .find(|(role, _)| *role == self)
            .map(|(_, caps)| *caps)
            .unwrap_or(&[])
    }

    pub fn can(self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    pub fn require(self, capability: Capability) -> Result<()> {
        if self.can(capability) {
            Ok(())
        } else {
            Err(anyhow!("role {:?} lacks capability {:?}", self, capability))
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" | "super_admin" | "superadmin" => Ok(Role::Admin),
            "manager" | "supervisor" => Ok(Role::Manager),
            "operator" => Ok(Role::Operator),
            "viewer" => Ok(Role::Viewer),
            other => Err(anyhow!("unknown role '{}'", other)),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

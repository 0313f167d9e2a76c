use serde::{Deserialize, Serialize};
use std::fmt;

/// One row of the input list, before the owning subscription is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRecord {
    #[serde(rename = "Subscription")]
    pub subscription: String,
    #[serde(rename = "ResourceGroup")]
    pub resource_group: String,
    #[serde(rename = "VmName")]
    pub vm_name: String,
}

impl TargetRecord {
    pub fn new(
        subscription: impl Into<String>,
        resource_group: impl Into<String>,
        vm_name: impl Into<String>,
    ) -> Self {
        Self {
            subscription: subscription.into(),
            resource_group: resource_group.into(),
            vm_name: vm_name.into(),
        }
    }

    /// Bind the record to a resolved subscription id.
    pub fn resolve(self, subscription_id: impl Into<String>) -> Target {
        Target {
            subscription_name: self.subscription,
            subscription_id: subscription_id.into(),
            resource_group: self.resource_group,
            vm_name: self.vm_name,
        }
    }
}

/// A machine to repair, fully populated before it is handed to a worker.
///
/// Fields are private so a dispatched target can't be mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    subscription_name: String,
    subscription_id: String,
    resource_group: String,
    vm_name: String,
}

impl Target {
    pub fn subscription_name(&self) -> &str {
        &self.subscription_name
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_group, self.vm_name)
    }
}

use uuid::Uuid;

const SUFFIX_LEN: usize = 8;

/// Per-attempt namespacing for the throwaway repair resources.
///
/// Lives only inside the worker running the attempt.
#[derive(Clone)]
pub struct RepairSession {
    suffix: String,
    admin_password: String,
    repair_vm_id: Option<String>,
}

impl RepairSession {
    pub fn new() -> Self {
        Self::with_suffix(random_suffix())
    }

    pub fn with_suffix(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            admin_password: generate_admin_password(),
            repair_vm_id: None,
        }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn repair_resource_group_name(&self) -> String {
        format!("repair-{}-rg", self.suffix)
    }

    /// Eight hex chars keep this within the 15 character Windows host name limit.
    pub fn repair_vm_name(&self) -> String {
        format!("repair{}", self.suffix)
    }

    pub fn admin_password(&self) -> &str {
        &self.admin_password
    }

    pub fn repair_vm_id(&self) -> Option<&str> {
        self.repair_vm_id.as_deref()
    }

    /// Record the repair VM's resource id once it exists.
    pub fn record_repair_vm(&mut self, subscription_id: &str) -> &str {
        let id = format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines/{}",
            subscription_id,
            self.repair_resource_group_name(),
            self.repair_vm_name()
        );
        self.repair_vm_id.insert(id).as_str()
    }
}

impl Default for RepairSession {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RepairSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairSession")
            .field("suffix", &self.suffix)
            .field("admin_password", &"<redacted>")
            .field("repair_vm_id", &self.repair_vm_id)
            .finish()
    }
}

fn random_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..SUFFIX_LEN].to_string()
}

/// Upper, lower, digit and symbol classes are always present.
fn generate_admin_password() -> String {
    format!("Rp#{}9z", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_names() {
        let session = RepairSession::with_suffix("ab12cd34");
        assert_eq!(session.repair_resource_group_name(), "repair-ab12cd34-rg");
        assert_eq!(session.repair_vm_name(), "repairab12cd34");
        assert!(session.repair_vm_name().len() <= 15);
        assert!(session.repair_vm_id().is_none());
    }

    #[test]
    fn test_suffixes_are_unique_per_attempt() {
        let a = RepairSession::new();
        let b = RepairSession::new();
        assert_eq!(a.suffix().len(), SUFFIX_LEN);
        assert_ne!(a.suffix(), b.suffix());
        assert_ne!(a.admin_password(), b.admin_password());
    }

    #[test]
    fn test_record_repair_vm_id() {
        let mut session = RepairSession::with_suffix("ab12cd34");
        let id = session.record_repair_vm("sub-1").to_string();
        assert_eq!(
            id,
            "/subscriptions/sub-1/resourceGroups/repair-ab12cd34-rg/providers/Microsoft.Compute/virtualMachines/repairab12cd34"
        );
        assert_eq!(session.repair_vm_id(), Some(id.as_str()));
    }

    #[test]
    fn test_debug_redacts_password() {
        let session = RepairSession::new();
        let rendered = format!("{:?}", session);
        assert!(!rendered.contains(session.admin_password()));
        assert!(rendered.contains("<redacted>"));
    }
}

use std::fmt;

/// Service principal used to establish the control-plane context for each
/// subscription batch.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub principal: String,
    pub secret: String,
    pub tenant: String,
}

impl Credentials {
    pub fn new(
        principal: impl Into<String>,
        secret: impl Into<String>,
        tenant: impl Into<String>,
    ) -> Self {
        Self {
            principal: principal.into(),
            secret: secret.into(),
            tenant: tenant.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.principal.trim().is_empty()
            && !self.secret.trim().is_empty()
            && !self.tenant.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .field("tenant", &self.tenant)
            .finish()
    }
}

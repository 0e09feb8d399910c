use stockbook_core::TenantId;

use crate::errors::ApiError;

/// The caller's tenant, resolved by the transport before any operation runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// Resolve the tenant or fail with `InvalidArgument`.
pub fn require_tenant(ctx: Option<TenantContext>) -> Result<TenantId, ApiError> {
    ctx.map(|c| c.tenant_id()).ok_or_else(ApiError::missing_tenant)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_context_is_invalid_argument() {
        let err = require_tenant(None).unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }

    #[test]
    fn present_context_yields_tenant() {
        let tenant = TenantId::new();
        assert_eq!(require_tenant(Some(TenantContext::new(tenant))).unwrap(), tenant);
    }
}

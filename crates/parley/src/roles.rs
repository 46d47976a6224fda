//! A fixed role directory.

use async_trait::async_trait;
use parley_core::{FlowError, Role, RoleId, RoleProvider};
use std::collections::HashMap;

/// A [`RoleProvider`] over a fixed set of roles.
///
/// # Examples
///
/// ```
/// use parley::{Role, RoleDirectory};
///
/// let roles = RoleDirectory::new()
///     .with(Role::new("pro", "Proponent", "Argue for the motion."))
///     .with(Role::new("con", "Opponent", "Argue against the motion."));
/// assert_eq!(roles.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RoleDirectory {
    roles: HashMap<RoleId, Role>,
}

impl RoleDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, role: Role) -> Self {
        self.roles.insert(role.id.clone(), role);
        self
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

#[async_trait]
impl RoleProvider for RoleDirectory {
    async fn get_role(&self, role_id: &RoleId) -> Result<Role, FlowError> {
        self.roles
            .get(role_id)
            .cloned()
            .ok_or_else(|| FlowError::RoleNotFound(role_id.clone()))
    }
}

use serde::Serialize;

use crate::types::Role;

/// Usage allowed per rolling quota window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlements {
    pub max_messages: i64,
    pub max_tokens: i64,
    pub max_files: i64,
}

const GUEST: Entitlements = Entitlements {
    max_messages: 20,
    max_tokens: 20_000,
    max_files: 5,
};

const USER: Entitlements = Entitlements {
    max_messages: 100,
    max_tokens: 250_000,
    max_files: 50,
};

const ADMIN: Entitlements = Entitlements {
    max_messages: 10_000,
    max_tokens: 10_000_000,
    max_files: 1_000,
};

pub fn entitlements_for(role: Role) -> Entitlements {
    match role {
        Role::Guest => GUEST,
        Role::User => USER,
        Role::Admin => ADMIN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_are_ordered_by_allowance() {
        let guest = entitlements_for(Role::Guest);
        let user = entitlements_for(Role::User);
        let admin = entitlements_for(Role::Admin);
        assert!(guest.max_messages < user.max_messages);
        assert!(user.max_tokens < admin.max_tokens);
        assert!(guest.max_files < admin.max_files);
    }
}

//! Authorized mobile applications, as seen by the certificate verifier.
//!
//! The publish intake pipeline owns the full app registry; the verifier only
//! needs the membership set of health authorities an app may publish for.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// The slice of an authorized-app record the verifier consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedApp {
    pub app_package_name: String,
    pub allowed_health_authority_ids: BTreeSet<i64>,
}

impl AuthorizedApp {
    /// Whether the app may publish certificates from the given authority.
    #[must_use]
    pub fn is_authorized_for(&self, health_authority_id: i64) -> bool {
        self.allowed_health_authority_ids
            .contains(&health_authority_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_authorized_for() {
        let app = AuthorizedApp {
            app_package_name: "gov.example.exposure".to_string(),
            allowed_health_authority_ids: [1, 7].into_iter().collect(),
        };
        assert!(app.is_authorized_for(1));
        assert!(app.is_authorized_for(7));
        assert!(!app.is_authorized_for(2));
    }
}

//! Connection authentication and workspace access.
//!
//! Session issuance lives elsewhere; the server only needs to turn a bearer
//! token into an [`Identity`] and decide which workspaces it may join.

use schemaflow_core::{Identity, WorkspaceId};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

use crate::config::TokenIdentity;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("token rejected")]
    InvalidToken,
}

pub trait IdentityVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Fixed token table, usually from the server config.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(table: &BTreeMap<String, TokenIdentity>) -> Self {
        let tokens = table
            .iter()
            .map(|(token, id)| {
                (
                    token.clone(),
                    Identity::new(id.user_id.clone(), id.username.clone()),
                )
            })
            .collect();
        Self { tokens }
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

/// Decides whether an authenticated identity may join a workspace room.
pub trait WorkspaceAccess: Send + Sync + 'static {
    fn can_join(&self, identity: &Identity, workspace_id: &WorkspaceId) -> bool;
}

/// Workspaces listed as private admit only their members; the rest are open.
#[derive(Debug, Clone, Default)]
pub struct MemberListAccess {
    private: HashMap<WorkspaceId, HashSet<String>>,
}

impl MemberListAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(table: &BTreeMap<String, Vec<String>>) -> Self {
        let private = table
            .iter()
            .map(|(ws, members)| (WorkspaceId::from(ws.as_str()), members.iter().cloned().collect()))
            .collect();
        Self { private }
    }

    pub fn with_private(
        mut self,
        workspace_id: WorkspaceId,
        members: impl IntoIterator<Item = String>,
    ) -> Self {
        self.private.insert(workspace_id, members.into_iter().collect());
        self
    }
}

impl WorkspaceAccess for MemberListAccess {
    fn can_join(&self, identity: &Identity, workspace_id: &WorkspaceId) -> bool {
        self.private
            .get(workspace_id)
            .map_or(true, |members| members.contains(&identity.user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_workspace_admits_members_only() {
        let access = MemberListAccess::new()
            .with_private(WorkspaceId::from("secret"), ["u1".to_string()]);
        let alice = Identity::new("u1", "alice");
        let bob = Identity::new("u2", "bob");
        assert!(access.can_join(&alice, &WorkspaceId::from("secret")));
        assert!(!access.can_join(&bob, &WorkspaceId::from("secret")));
        assert!(access.can_join(&bob, &WorkspaceId::from("public")));
    }

    #[test]
    fn test_access_from_config_table() {
        let table = BTreeMap::from([("W9".to_string(), vec!["u9".to_string()])]);
        let access = MemberListAccess::from_table(&table);
        assert!(access.can_join(&Identity::new("u9", "zoe"), &WorkspaceId::from("W9")));
        assert!(!access.can_join(&Identity::new("u1", "al"), &WorkspaceId::from("W9")));
    }

    #[test]
    fn test_known_token() {
        let verifier = StaticTokenVerifier::new().with_token("t-a", Identity::new("u1", "alice"));
        let identity = verifier.verify("t-a").unwrap();
        assert_eq!(identity.username, "alice");
        assert_eq!(verifier.verify("Bearer t-a").unwrap(), identity);
    }

    #[test]
    fn test_rejections() {
        let verifier = StaticTokenVerifier::new().with_token("t-a", Identity::new("u1", "alice"));
        assert_eq!(verifier.verify(""), Err(AuthError::MissingToken));
        assert_eq!(verifier.verify("t-b"), Err(AuthError::InvalidToken));
    }

    #[test]
    fn test_from_config_table() {
        let table = BTreeMap::from([(
            "secret".to_string(),
            TokenIdentity {
                user_id: "u9".into(),
                username: "zoe".into(),
            },
        )]);
        let verifier = StaticTokenVerifier::from_table(&table);
        assert_eq!(verifier.len(), 1);
        assert_eq!(verifier.verify("secret").unwrap().user_id, "u9");
    }
}

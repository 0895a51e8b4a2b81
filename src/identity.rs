// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Callers, access control lists, and the collaborators that evaluate them.
//!
//! Every storage and transit operation receives a [`CallerContext`]
//! describing who is asking: the owner (holding the tenant master key), a
//! connected peer identity, an app with drive grants, or an anonymous
//! visitor. ACL evaluation itself is delegated to a [`DriveAclAuthorizer`];
//! [`DefaultAclAuthorizer`] implements the standard security-group rules on
//! top of a [`CircleNetwork`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::SymmetricKey;
use crate::drive::TargetDrive;
use crate::error::{HostError, HostResult};

/// Domain name of an identity, e.g. `sam.dotyou.cloud`. Always lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OdinId(String);

impl OdinId {
    pub fn new(domain: &str) -> Self {
        Self(domain.trim().trim_end_matches('.').to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.contains('.')
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    }
}

impl fmt::Display for OdinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OdinId {
    fn from(s: &str) -> Self {
        OdinId::new(s)
    }
}

/// Security levels, ordered from least to most trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecurityGroup {
    Anonymous,
    Authenticated,
    Connected,
    Owner,
}

impl SecurityGroup {
    pub fn as_i32(&self) -> i32 {
        match self {
            SecurityGroup::Anonymous => 111,
            SecurityGroup::Authenticated => 222,
            SecurityGroup::Connected => 333,
            SecurityGroup::Owner => 999,
        }
    }
}

/// Access control list attached to every file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlList {
    pub required_security_group: SecurityGroup,
    #[serde(default)]
    pub circle_id_list: Vec<Uuid>,
    #[serde(default)]
    pub odin_id_list: Vec<OdinId>,
}

impl AccessControlList {
    pub fn owner_only() -> Self {
        Self::for_group(SecurityGroup::Owner)
    }

    pub fn anonymous() -> Self {
        Self::for_group(SecurityGroup::Anonymous)
    }

    pub fn for_group(group: SecurityGroup) -> Self {
        Self {
            required_security_group: group,
            circle_id_list: Vec::new(),
            odin_id_list: Vec::new(),
        }
    }

    /// True when the list names specific circles or identities.
    pub fn is_restricted(&self) -> bool {
        !self.circle_id_list.is_empty() || !self.odin_id_list.is_empty()
    }
}

/// Read/write permission on one drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DrivePermission {
    pub read: bool,
    pub write: bool,
}

impl DrivePermission {
    pub const NONE: DrivePermission = DrivePermission { read: false, write: false };
    pub const READ: DrivePermission = DrivePermission { read: true, write: false };
    pub const WRITE: DrivePermission = DrivePermission { read: false, write: true };
    pub const READ_WRITE: DrivePermission = DrivePermission { read: true, write: true };

    pub fn has(&self, required: DrivePermission) -> bool {
        (!required.read || self.read) && (!required.write || self.write)
    }
}

/// A non-owner's access to one drive, optionally with the storage key
/// that lets the holder decrypt key headers on it.
#[derive(Debug, Clone)]
pub struct DriveGrant {
    pub permission: DrivePermission,
    pub storage_key: Option<SymmetricKey>,
}

/// Who is calling, and what they can unlock.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub odin_id: Option<OdinId>,
    pub security_level: SecurityGroup,
    pub circles: Vec<Uuid>,
    master_key: Option<SymmetricKey>,
    shared_secret: Option<SymmetricKey>,
    drive_grants: HashMap<Uuid, DriveGrant>,
}

impl CallerContext {
    /// The tenant owner, holding the master key.
    pub fn owner(tenant: OdinId, master_key: SymmetricKey, shared_secret: Option<SymmetricKey>) -> Self {
        Self {
            odin_id: Some(tenant),
            security_level: SecurityGroup::Owner,
            circles: Vec::new(),
            master_key: Some(master_key),
            shared_secret,
            drive_grants: HashMap::new(),
        }
    }

    /// Background work (outbox/inbox processing) acting for the owner.
    pub fn system(tenant: OdinId, master_key: SymmetricKey) -> Self {
        Self::owner(tenant, master_key, None)
    }

    pub fn anonymous() -> Self {
        Self {
            odin_id: None,
            security_level: SecurityGroup::Anonymous,
            circles: Vec::new(),
            master_key: None,
            shared_secret: None,
            drive_grants: HashMap::new(),
        }
    }

    /// A remote identity (or an app acting for one) with explicit grants.
    pub fn peer(
        odin_id: OdinId,
        security_level: SecurityGroup,
        circles: Vec<Uuid>,
        shared_secret: Option<SymmetricKey>,
    ) -> Self {
        Self {
            odin_id: Some(odin_id),
            security_level,
            circles,
            master_key: None,
            shared_secret,
            drive_grants: HashMap::new(),
        }
    }

    pub fn with_drive_grant(mut self, drive_id: Uuid, grant: DriveGrant) -> Self {
        self.drive_grants.insert(drive_id, grant);
        self
    }

    pub fn is_owner(&self) -> bool {
        self.security_level == SecurityGroup::Owner
    }

    pub fn is_anonymous(&self) -> bool {
        self.security_level == SecurityGroup::Anonymous
    }

    pub fn master_key(&self) -> Option<&SymmetricKey> {
        self.master_key.as_ref()
    }

    pub fn shared_secret(&self) -> Option<&SymmetricKey> {
        self.shared_secret.as_ref()
    }

    pub fn drive_grant(&self, drive_id: &Uuid) -> Option<&DriveGrant> {
        self.drive_grants.get(drive_id)
    }

    pub fn assert_has_master_key(&self) -> HostResult<&SymmetricKey> {
        self.master_key.as_ref().ok_or_else(|| {
            tracing::warn!(caller = ?self.odin_id, "Privileged drive operation without master key");
            HostError::security("the tenant master key is required")
        })
    }

    pub fn drive_permission(&self, drive_id: &Uuid) -> DrivePermission {
        if self.is_owner() && self.master_key.is_some() {
            return DrivePermission::READ_WRITE;
        }
        self.drive_grants
            .get(drive_id)
            .map(|g| g.permission)
            .unwrap_or(DrivePermission::NONE)
    }

    pub fn has_drive_permission(&self, drive_id: &Uuid, required: DrivePermission) -> bool {
        self.drive_permission(drive_id).has(required)
    }

    pub fn assert_drive_permission(&self, drive_id: &Uuid, required: DrivePermission) -> HostResult<()> {
        if self.has_drive_permission(drive_id, required) {
            Ok(())
        } else {
            tracing::warn!(
                caller = ?self.odin_id,
                drive_id = %drive_id,
                required = ?required,
                "Caller lacks drive permission"
            );
            Err(HostError::security(format!("no {required:?} permission on drive {drive_id}")))
        }
    }

    /// Identity used when stamping or checking senders.
    pub fn odin_id_or_fail(&self) -> HostResult<&OdinId> {
        self.odin_id
            .as_ref()
            .ok_or_else(|| HostError::security("caller has no identity"))
    }
}

/// Bearer token a remote host accepts from us.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientAuthToken(String);

impl ClientAuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClientAuthToken(<redacted>)")
    }
}

/// What we know about a connected identity.
#[derive(Debug, Clone, Default)]
pub struct Connection {
    /// Token we present when calling their host.
    pub outgoing_token: Option<ClientAuthToken>,
    /// Token they present when calling ours.
    pub incoming_token: Option<ClientAuthToken>,
    pub circles: Vec<Uuid>,
    pub drive_grants: Vec<(TargetDrive, DrivePermission)>,
}

/// Circle/connection membership, consumed by ACL evaluation and transit.
#[async_trait]
pub trait CircleNetwork: Send + Sync {
    async fn connection(&self, odin_id: &OdinId) -> Option<Connection>;

    /// Token used to authenticate to `odin_id`'s host.
    async fn client_auth_token(&self, odin_id: &OdinId) -> Option<ClientAuthToken> {
        self.connection(odin_id).await.and_then(|c| c.outgoing_token)
    }

    /// Check a token presented by `odin_id` on an inbound peer request.
    async fn verify_peer_token(&self, odin_id: &OdinId, token: &str) -> bool {
        match self.connection(odin_id).await.and_then(|c| c.incoming_token) {
            Some(expected) => expected.as_str() == token,
            None => false,
        }
    }

    async fn drive_permission(&self, odin_id: &OdinId, target: &TargetDrive) -> DrivePermission {
        self.connection(odin_id)
            .await
            .and_then(|c| {
                c.drive_grants
                    .iter()
                    .find(|(t, _)| t == target)
                    .map(|(_, p)| *p)
            })
            .unwrap_or(DrivePermission::NONE)
    }
}

/// In-memory connection registry.
#[derive(Default)]
pub struct InMemoryCircleNetwork {
    connections: RwLock<HashMap<OdinId, Connection>>,
}

impl InMemoryCircleNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self, odin_id: OdinId, connection: Connection) {
        self.connections.write().await.insert(odin_id, connection);
    }

    pub async fn disconnect(&self, odin_id: &OdinId) {
        self.connections.write().await.remove(odin_id);
    }
}

#[async_trait]
impl CircleNetwork for InMemoryCircleNetwork {
    async fn connection(&self, odin_id: &OdinId) -> Option<Connection> {
        self.connections.read().await.get(odin_id).cloned()
    }
}

/// ACL evaluation.
#[async_trait]
pub trait DriveAclAuthorizer: Send + Sync {
    fn caller_has_permission(&self, caller: &CallerContext, acl: &AccessControlList) -> bool;

    fn assert_caller_has_permission(&self, caller: &CallerContext, acl: &AccessControlList) -> HostResult<()> {
        if self.caller_has_permission(caller, acl) {
            Ok(())
        } else {
            tracing::warn!(
                caller = ?caller.odin_id,
                required = ?acl.required_security_group,
                "Caller does not satisfy file ACL"
            );
            Err(HostError::security("caller does not satisfy the file access control list"))
        }
    }

    /// Evaluate an ACL for an identity that is not the current caller,
    /// e.g. a transit recipient.
    async fn identity_has_permission(&self, odin_id: &OdinId, acl: &AccessControlList) -> bool;
}

/// Security-group ACL rules over a [`CircleNetwork`].
pub struct DefaultAclAuthorizer {
    network: Arc<dyn CircleNetwork>,
}

impl DefaultAclAuthorizer {
    pub fn new(network: Arc<dyn CircleNetwork>) -> Self {
        Self { network }
    }

    fn evaluate(
        level: SecurityGroup,
        odin_id: Option<&OdinId>,
        circles: &[Uuid],
        acl: &AccessControlList,
    ) -> bool {
        if level == SecurityGroup::Owner {
            return true;
        }
        if level < acl.required_security_group {
            return false;
        }
        if !acl.is_restricted() {
            return true;
        }
        let by_identity = odin_id.map(|id| acl.odin_id_list.contains(id)).unwrap_or(false);
        let by_circle = circles.iter().any(|c| acl.circle_id_list.contains(c));
        by_identity || by_circle
    }
}

#[async_trait]
impl DriveAclAuthorizer for DefaultAclAuthorizer {
    fn caller_has_permission(&self, caller: &CallerContext, acl: &AccessControlList) -> bool {
        Self::evaluate(caller.security_level, caller.odin_id.as_ref(), &caller.circles, acl)
    }

    async fn identity_has_permission(&self, odin_id: &OdinId, acl: &AccessControlList) -> bool {
        let (level, circles) = match self.network.connection(odin_id).await {
            Some(conn) => (SecurityGroup::Connected, conn.circles),
            None => (SecurityGroup::Authenticated, Vec::new()),
        };
        Self::evaluate(level, Some(odin_id), &circles, acl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(level: SecurityGroup, circles: Vec<Uuid>) -> CallerContext {
        CallerContext::peer(OdinId::new("sam.dotyou.cloud"), level, circles, None)
    }

    fn authorizer() -> DefaultAclAuthorizer {
        DefaultAclAuthorizer::new(Arc::new(InMemoryCircleNetwork::new()))
    }

    #[test]
    fn odin_id_is_normalized() {
        let id = OdinId::new("  Sam.DotYou.Cloud. ");
        assert_eq!(id.as_str(), "sam.dotyou.cloud");
        assert!(id.is_valid());
        assert!(!OdinId::new("not a domain").is_valid());
    }

    #[test]
    fn security_levels_are_ordered() {
        assert!(SecurityGroup::Anonymous < SecurityGroup::Authenticated);
        assert!(SecurityGroup::Authenticated < SecurityGroup::Connected);
        assert!(SecurityGroup::Connected < SecurityGroup::Owner);
    }

    #[test]
    fn owner_passes_every_acl() {
        let owner = CallerContext::owner(
            OdinId::new("frodo.dotyou.cloud"),
            SymmetricKey::generate().unwrap(),
            None,
        );
        assert!(authorizer().caller_has_permission(&owner, &AccessControlList::owner_only()));
    }

    #[test]
    fn level_below_required_group_is_denied() {
        let auth = authorizer();
        let caller = peer(SecurityGroup::Authenticated, vec![]);
        assert!(auth.caller_has_permission(&caller, &AccessControlList::for_group(SecurityGroup::Authenticated)));
        assert!(!auth.caller_has_permission(&caller, &AccessControlList::for_group(SecurityGroup::Connected)));
        assert!(auth.assert_caller_has_permission(&caller, &AccessControlList::owner_only()).is_err());
    }

    #[test]
    fn restricted_acl_requires_circle_or_identity() {
        let auth = authorizer();
        let circle = Uuid::new_v4();
        let mut acl = AccessControlList::for_group(SecurityGroup::Connected);
        acl.circle_id_list.push(circle);

        assert!(!auth.caller_has_permission(&peer(SecurityGroup::Connected, vec![]), &acl));
        assert!(auth.caller_has_permission(&peer(SecurityGroup::Connected, vec![circle]), &acl));

        acl.circle_id_list.clear();
        acl.odin_id_list.push(OdinId::new("sam.dotyou.cloud"));
        assert!(auth.caller_has_permission(&peer(SecurityGroup::Connected, vec![]), &acl));
    }

    #[tokio::test]
    async fn identity_permission_uses_connection_state() {
        let network = Arc::new(InMemoryCircleNetwork::new());
        let auth = DefaultAclAuthorizer::new(network.clone());
        let sam = OdinId::new("sam.dotyou.cloud");
        let connected = AccessControlList::for_group(SecurityGroup::Connected);

        assert!(!auth.identity_has_permission(&sam, &connected).await);
        network.connect(sam.clone(), Connection::default()).await;
        assert!(auth.identity_has_permission(&sam, &connected).await);
        assert!(!auth.identity_has_permission(&sam, &AccessControlList::owner_only()).await);
    }

    #[test]
    fn drive_permission_from_grants() {
        let drive = Uuid::new_v4();
        let caller = peer(SecurityGroup::Connected, vec![]).with_drive_grant(
            drive,
            DriveGrant {
                permission: DrivePermission::READ,
                storage_key: None,
            },
        );
        assert!(caller.has_drive_permission(&drive, DrivePermission::READ));
        assert!(!caller.has_drive_permission(&drive, DrivePermission::WRITE));
        assert!(caller.assert_drive_permission(&Uuid::new_v4(), DrivePermission::READ).is_err());
    }
}

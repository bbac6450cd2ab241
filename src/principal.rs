//! Principal resolution
//!
//! An authenticated host passes its principal in directly. Without one, a guest
//! is provisioned: a short handle plus a per-guest secret are generated once,
//! persisted locally, and exchanged with the identity provider for a stable id.
//! Running the exchange twice with the same credential yields the same id.

use crate::error::TelemetryError;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    Authenticated,
    Anonymous,
}

/// Identity every event and session is attributed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub kind: PrincipalKind,
}

impl Principal {
    pub fn authenticated(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: PrincipalKind::Authenticated,
        }
    }

    pub fn anonymous(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: PrincipalKind::Anonymous,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.kind == PrincipalKind::Anonymous
    }
}

/// Locally persisted guest credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestCredential {
    /// Short display handle, e.g. `guest-3f9a1c2e`
    pub handle: String,
    /// Per-guest secret, never shared between guests
    pub secret: String,
}

impl GuestCredential {
    pub fn generate() -> Self {
        let handle_id = Uuid::new_v4().simple().to_string();
        Self {
            handle: format!("guest-{}", &handle_id[..8]),
            secret: Uuid::new_v4().simple().to_string(),
        }
    }
}

/// Local persistence for the guest credential
pub trait HandleStore {
    fn load(&self) -> Result<Option<GuestCredential>, TelemetryError>;

    fn save(&mut self, credential: &GuestCredential) -> Result<(), TelemetryError>;
}

/// Exchanges a guest credential for a stable principal id
pub trait IdentityProvider {
    /// Idempotent create-or-sign-in
    fn sign_in_or_create(&mut self, credential: &GuestCredential)
        -> Result<String, TelemetryError>;
}

/// Handle store kept in memory. Clones share the slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryHandleStore {
    slot: Rc<RefCell<Option<GuestCredential>>>,
}

impl MemoryHandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<GuestCredential> {
        self.slot.borrow().clone()
    }
}

impl HandleStore for MemoryHandleStore {
    fn load(&self) -> Result<Option<GuestCredential>, TelemetryError> {
        Ok(self.slot.borrow().clone())
    }

    fn save(&mut self, credential: &GuestCredential) -> Result<(), TelemetryError> {
        *self.slot.borrow_mut() = Some(credential.clone());
        Ok(())
    }
}

/// Handle store backed by a JSON file
#[derive(Debug, Clone)]
pub struct FileHandleStore {
    path: PathBuf,
}

impl FileHandleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HandleStore for FileHandleStore {
    fn load(&self) -> Result<Option<GuestCredential>, TelemetryError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&mut self, credential: &GuestCredential) -> Result<(), TelemetryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(credential)?)?;
        Ok(())
    }
}

/// Namespace for ids derived by [`LocalIdentityProvider`]
pub const GUEST_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6c, 0x75, 0x6d, 0x65, 0x6e, 0x2d, 0x47, 0x75, 0x80, 0x65, 0x73, 0x74, 0x2d, 0x69, 0x64, 0x73,
]);

/// Offline provider: the principal id is a name-based UUID over the credential
#[derive(Debug, Clone)]
pub struct LocalIdentityProvider {
    namespace: Uuid,
}

impl LocalIdentityProvider {
    pub fn new() -> Self {
        Self {
            namespace: GUEST_NAMESPACE,
        }
    }

    pub fn with_namespace(namespace: Uuid) -> Self {
        Self { namespace }
    }
}

impl Default for LocalIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityProvider for LocalIdentityProvider {
    fn sign_in_or_create(
        &mut self,
        credential: &GuestCredential,
    ) -> Result<String, TelemetryError> {
        if credential.handle.is_empty() || credential.secret.is_empty() {
            return Err(TelemetryError::PrincipalProvisioning(
                "guest credential is incomplete".to_string(),
            ));
        }
        let name = format!("{}:{}", credential.handle, credential.secret);
        Ok(Uuid::new_v5(&self.namespace, name.as_bytes()).to_string())
    }
}

/// Load or create the guest credential and exchange it for a principal
pub fn provision_guest(
    handles: &mut dyn HandleStore,
    identity: &mut dyn IdentityProvider,
) -> Result<Principal, TelemetryError> {
    let credential = match handles.load().map_err(provisioning)? {
        Some(credential) => {
            debug!(handle = %credential.handle, "Reusing stored guest credential");
            credential
        }
        None => {
            let credential = GuestCredential::generate();
            handles.save(&credential).map_err(provisioning)?;
            info!(handle = %credential.handle, "Created guest credential");
            credential
        }
    };

    let id = identity
        .sign_in_or_create(&credential)
        .map_err(provisioning)?;
    Ok(Principal::anonymous(id))
}

fn provisioning(err: TelemetryError) -> TelemetryError {
    match err {
        TelemetryError::PrincipalProvisioning(_) => err,
        other => TelemetryError::PrincipalProvisioning(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DownProvider;

    impl IdentityProvider for DownProvider {
        fn sign_in_or_create(
            &mut self,
            _credential: &GuestCredential,
        ) -> Result<String, TelemetryError> {
            Err(TelemetryError::Transport("identity service unreachable".into()))
        }
    }

    #[test]
    fn test_guest_credentials_are_unique() {
        let a = GuestCredential::generate();
        let b = GuestCredential::generate();
        assert!(a.handle.starts_with("guest-"));
        assert_eq!(a.handle.len(), "guest-".len() + 8);
        assert_ne!(a.secret, b.secret);
    }

    #[test]
    fn test_provisioning_is_stable_for_stored_credential() {
        let mut handles = MemoryHandleStore::new();
        let mut identity = LocalIdentityProvider::new();

        let first = provision_guest(&mut handles, &mut identity).unwrap();
        let second = provision_guest(&mut handles, &mut identity).unwrap();

        assert!(first.is_anonymous());
        assert_eq!(first, second);
        assert!(handles.current().is_some());
    }

    #[test]
    fn test_distinct_guests_get_distinct_ids() {
        let mut identity = LocalIdentityProvider::new();
        let a = provision_guest(&mut MemoryHandleStore::new(), &mut identity).unwrap();
        let b = provision_guest(&mut MemoryHandleStore::new(), &mut identity).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_provider_failure_maps_to_provisioning_error() {
        let mut handles = MemoryHandleStore::new();
        let err = provision_guest(&mut handles, &mut DownProvider).unwrap_err();
        assert!(matches!(err, TelemetryError::PrincipalProvisioning(_)));
        // Credential is kept for the next attempt
        assert!(handles.current().is_some());
    }

    #[test]
    fn test_file_handle_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileHandleStore::new(dir.path().join("guest.json"));
        assert!(store.load().unwrap().is_none());

        let credential = GuestCredential::generate();
        store.save(&credential).unwrap();
        assert_eq!(store.load().unwrap(), Some(credential));
    }
}

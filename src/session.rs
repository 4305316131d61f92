//! Session context: who is signed in and which peer is selected.

/// Session state reported by the external identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// A user authenticated successfully.
    SignedIn {
        /// Stable identity assigned by the provider.
        identity: String,
        /// Email or handle shown to the user.
        handle: String,
    },
    /// No user is authenticated.
    SignedOut,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::SignedIn { .. })
    }
}

/// Parameters shared by every component for one signed-in session.
///
/// The identity never changes for the life of the value; only the selected
/// peer moves, driven by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    self_identity: String,
    handle: String,
    selected_peer: Option<String>,
}

impl SessionContext {
    pub fn new(self_identity: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            self_identity: self_identity.into(),
            handle: handle.into(),
            selected_peer: None,
        }
    }

    /// Build a session from a provider notification; `None` when signed out.
    pub fn from_auth(state: &AuthState) -> Option<Self> {
        match state {
            AuthState::SignedIn { identity, handle } => Some(Self::new(identity.clone(), handle.clone())),
            AuthState::SignedOut => None,
        }
    }

    pub fn self_identity(&self) -> &str {
        &self.self_identity
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn selected_peer(&self) -> Option<&str> {
        self.selected_peer.as_deref()
    }

    /// Change the selected peer. Returns true if the selection changed.
    pub fn select_peer(&mut self, peer: Option<String>) -> bool {
        if self.selected_peer == peer {
            return false;
        }
        self.selected_peer = peer;
        true
    }

    /// Copy of this session with `peer` selected.
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.selected_peer = Some(peer.into());
        self
    }
}

//! Login handshake.
//!
//! The server opens every session with an auth challenge. We answer with
//! `SHA1(SHA1(user ":" password) || challenge)` together with the user name
//! and whether we accept the server license. While the answer is in flight
//! the session is *authenticating*: keepalives are suspended and interval
//! uploads are dropped. The window closes on the server's reply or after a
//! fixed timeout, whichever comes first. Between sessions the state is
//! disconnected, and uploads are dropped then too.

use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::protocol::{AuthChallenge, AuthUser, CLIENT_CAP_AGREE, CLIENT_VERSION};

/// Prefix the server expects in front of anonymous user names.
pub const ANONYMOUS_PREFIX: &str = "anonymous:";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum AuthState {
    /// No session. Set before the first connect and whenever one ends.
    #[default]
    Disconnected,
    /// Connected, no handshake in progress.
    Idle,
    /// Challenge answered, reply pending.
    Authenticating,
    /// The server accepted our login.
    Authenticated,
}

impl AuthState {
    pub fn is_pending(self) -> bool {
        self == AuthState::Authenticating
    }

    /// Whether interval uploads may be queued in this state.
    pub fn accepts_uploads(self) -> bool {
        matches!(self, AuthState::Idle | AuthState::Authenticated)
    }
}

/// Name sent on the wire for the configured user.
pub fn login_name(user_name: &str, anonymous: bool) -> String {
    if anonymous {
        format!("{ANONYMOUS_PREFIX}{user_name}")
    } else {
        user_name.to_string()
    }
}

pub fn password_hash(login_name: &str, password: &str, challenge: &[u8; 8]) -> [u8; 20] {
    let inner = Sha1::new()
        .chain_update(login_name.as_bytes())
        .chain_update(b":")
        .chain_update(password.as_bytes())
        .finalize();
    Sha1::new()
        .chain_update(inner)
        .chain_update(challenge)
        .finalize()
        .into()
}

/// Build the login payload answering `challenge`. The license, if any, is
/// always accepted: a bot has nobody to ask.
pub fn login(user_name: &str, password: &str, anonymous: bool, challenge: &AuthChallenge) -> AuthUser {
    let name = login_name(user_name, anonymous);
    AuthUser {
        password_hash: password_hash(&name, password, &challenge.challenge),
        user_name: name,
        client_caps: if challenge.has_agreement() { CLIENT_CAP_AGREE } else { 0 },
        client_version: CLIENT_VERSION,
    }
}

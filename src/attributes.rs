//! The transport's attribute set (spec §3, §6).
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! A closed set of well-known keys, so accessors are typed fields rather
//! than a stringly-keyed map: the spec enumerates exactly what goes in
//! here, and a generic map would only reintroduce lookup failures this
//! design otherwise avoids.

/// Security level attributed to a transport once setup completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityLevel {
    /// No security guarantee has been established yet.
    #[default]
    None,
    /// Messages are authenticated but not confidential.
    Integrity,
    /// Messages are both authenticated and confidential.
    PrivacyAndIntegrity,
}

/// Governs how inbound parcelable payloads are handled by the layer above
/// this transport. Opaque to the transport core itself; carried purely as
/// an attribute for the RPC framework to consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParcelablePolicy {
    /// Reject payloads containing embedded parcelables.
    #[default]
    RejectAll,
    /// Allow them.
    AllowAll,
}

/// The transport's incrementally-populated attribute set.
///
/// Populated in two passes: an initial set at construction (addresses,
/// parcelable policy, tentative security level), and a setup-completion set
/// (remote uid, final security level) once the handshake finishes.
#[derive(Debug, Clone, Default)]
pub struct Attributes {
    /// Local endpoint identity, e.g. a service/package descriptor.
    pub local_address: Option<String>,
    /// Remote endpoint identity, as reported by the binding layer.
    pub remote_address: Option<String>,
    /// The policy governing embedded parcelables, set at construction.
    pub parcelable_policy: ParcelablePolicy,
    /// Security level; `None` until setup completes.
    pub security_level: SecurityLevel,
    /// The peer's kernel-reported uid, set once setup completes.
    pub remote_uid: Option<i32>,
    /// The authority string the server is listening as, if applicable.
    pub server_authority: Option<String>,
}

impl Attributes {
    /// Build the initial attribute set populated at construction time.
    #[must_use]
    pub fn initial(
        local_address: Option<String>,
        remote_address: Option<String>,
        parcelable_policy: ParcelablePolicy,
    ) -> Self {
        Self {
            local_address,
            remote_address,
            parcelable_policy,
            security_level: SecurityLevel::None,
            remote_uid: None,
            server_authority: None,
        }
    }

    /// Apply the setup-completion attributes: remote uid, and the security
    /// level derived from comparing it against `local_uid`.
    ///
    /// Per spec design notes §9, the uid-compare is the default policy; a
    /// `SecurityPolicy`-driven attribution is a hook callers may layer on
    /// top by overwriting `security_level` after calling this.
    pub fn apply_setup_identity(&mut self, remote_uid: i32, local_uid: i32) {
        self.remote_uid = Some(remote_uid);
        self.security_level = if remote_uid == local_uid {
            SecurityLevel::PrivacyAndIntegrity
        } else {
            SecurityLevel::Integrity
        };
    }
}

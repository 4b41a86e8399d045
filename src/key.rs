use std::{
    fmt,
    hash::{Hash, Hasher},
    net::SocketAddr,
    sync::{Arc, Weak},
};

use smol_str::SmolStr;

use crate::creator::Authenticator;

pub const CHECKSUM_LEN: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertInfo {
    /// PEM content or path of the client certificate.
    pub certificate: SmolStr,
    pub private_key: SmolStr,
    pub sni_filters: Vec<SmolStr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyOptions {
    /// Peer certificate chain depth to verify, 0 disables verification.
    pub verify_depth: i32,
    /// Empty means the system default CA bundle.
    pub ca_file_path: SmolStr,
}

/// Client side TLS parameters of a channel.
///
/// Sockets negotiated with different options can't be shared, so every field
/// takes part in the key checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSslOptions {
    pub ciphers: SmolStr,
    pub protocols: SmolStr,
    pub sni_name: SmolStr,
    pub client_cert: CertInfo,
    pub verify: VerifyOptions,
    pub alpn_protocols: Vec<SmolStr>,
}

impl Default for ChannelSslOptions {
    fn default() -> Self {
        Self {
            ciphers: SmolStr::default(),
            protocols: SmolStr::new_inline("TLSv1.2, TLSv1.3"),
            sni_name: SmolStr::default(),
            client_cert: CertInfo::default(),
            verify: VerifyOptions::default(),
            alpn_protocols: Vec::new(),
        }
    }
}

/// Everything that decides whether two channels may share one socket.
///
/// The authenticator is held weakly and compared by identity: two distinct
/// authenticator instances never share a socket, even when their contents are
/// equal.
#[derive(Clone)]
pub struct SocketMapKey {
    peer: SocketAddr,
    ssl_options: Option<ChannelSslOptions>,
    auth: Option<Weak<dyn Authenticator>>,
}

impl SocketMapKey {
    #[inline]
    pub const fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            ssl_options: None,
            auth: None,
        }
    }

    #[inline]
    pub fn with_ssl(mut self, ssl_options: ChannelSslOptions) -> Self {
        self.ssl_options = Some(ssl_options);
        self
    }

    #[inline]
    pub fn with_auth(mut self, auth: &Arc<dyn Authenticator>) -> Self {
        self.auth = Some(Arc::downgrade(auth));
        self
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub fn ssl_options(&self) -> Option<&ChannelSslOptions> {
        self.ssl_options.as_ref()
    }

    /// Upgrades the authenticator. `None` if there is none or it has been
    /// dropped by its owner.
    #[inline]
    pub fn auth(&self) -> Option<Arc<dyn Authenticator>> {
        self.auth.as_ref().and_then(Weak::upgrade)
    }

    /// Address of the authenticator allocation, 0 without one.
    #[inline]
    pub(crate) fn auth_identity(&self) -> usize {
        self.auth
            .as_ref()
            .map_or(0, |auth| auth.as_ptr().cast::<()>() as usize)
    }
}

impl PartialEq for SocketMapKey {
    fn eq(&self, other: &Self) -> bool {
        self.peer == other.peer
            && self.auth_identity() == other.auth_identity()
            && self.ssl_options == other.ssl_options
    }
}

impl Eq for SocketMapKey {}

impl fmt::Debug for SocketMapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketMapKey")
            .field("peer", &self.peer)
            .field("ssl_options", &self.ssl_options)
            .field("auth", &format_args!("{:#x}", self.auth_identity()))
            .finish()
    }
}

impl From<SocketAddr> for SocketMapKey {
    #[inline]
    fn from(peer: SocketAddr) -> Self {
        Self::new(peer)
    }
}

/// Fixed size stand-in for a [`SocketMapKey`] inside the map.
///
/// Two keys with the same peer and digest are treated as the same key. A
/// digest collision would make two different keys share a socket; with 128
/// bits this is accepted as never happening.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct KeyChecksum {
    peer: SocketAddr,
    checksum: [u8; CHECKSUM_LEN],
}

impl KeyChecksum {
    #[inline]
    pub fn new(key: &SocketMapKey) -> Self {
        Self {
            peer: key.peer,
            checksum: compute_checksum(key),
        }
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; CHECKSUM_LEN] {
        &self.checksum
    }
}

impl Hash for KeyChecksum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // The digest is evenly distributed, a slice of it is as good as all of it.
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.checksum[..8]);
        state.write_u64(u64::from_ne_bytes(head));
    }
}

impl fmt::Debug for KeyChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyChecksum({}, ", self.peer)?;
        for b in self.checksum {
            write!(f, "{:02x}", b)?;
        }
        f.write_str(")")
    }
}

/// 128-bit digest over the TLS options and the authenticator identity of
/// `key`. The peer is compared separately and is not part of the digest.
///
/// Stable for the lifetime of the process only: the authenticator identity is
/// an address.
pub fn compute_checksum(key: &SocketMapKey) -> [u8; CHECKSUM_LEN] {
    let mut hasher = blake3::Hasher::new();
    match &key.ssl_options {
        Some(ssl) => {
            hasher.update(&[1]);
            hash_ssl_options(&mut hasher, ssl);
        }
        None => {
            hasher.update(&[0]);
        }
    }
    hasher.update(&(key.auth_identity() as u64).to_le_bytes());

    let digest = hasher.finalize();
    let mut checksum = [0u8; CHECKSUM_LEN];
    checksum.copy_from_slice(&digest.as_bytes()[..CHECKSUM_LEN]);
    checksum
}

fn hash_ssl_options(hasher: &mut blake3::Hasher, ssl: &ChannelSslOptions) {
    update_str(hasher, &ssl.ciphers);
    update_str(hasher, &ssl.protocols);
    update_str(hasher, &ssl.sni_name);
    update_str(hasher, &ssl.client_cert.certificate);
    update_str(hasher, &ssl.client_cert.private_key);
    update_strs(hasher, &ssl.client_cert.sni_filters);
    hasher.update(&ssl.verify.verify_depth.to_le_bytes());
    update_str(hasher, &ssl.verify.ca_file_path);
    update_strs(hasher, &ssl.alpn_protocols);
}

// Length prefixed so that ("ab", "c") and ("a", "bc") differ.
#[inline]
fn update_str(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

#[inline]
fn update_strs(hasher: &mut blake3::Hasher, strs: &[SmolStr]) {
    hasher.update(&(strs.len() as u64).to_le_bytes());
    for s in strs {
        update_str(hasher, s);
    }
}

//! Host identity
//!
//! The overlay identity is an Ed25519 keypair. A configured secret is
//! unmarshalled; otherwise a fresh key is generated and reported back so
//! the caller can persist it together with the derived peer id.

use libp2p::identity::Keypair;
use libp2p::PeerId;

use crate::error::{P2pError, P2pResult};

/// A resolved host identity.
#[derive(Debug)]
pub struct HostIdentity {
    pub keypair: Keypair,
    pub peer_id: PeerId,
    /// True when no key was configured and a fresh one was generated.
    pub generated: bool,
}

/// Unmarshal the configured Ed25519 secret, or generate a new identity.
pub fn load_or_generate(secret: Option<&[u8]>) -> P2pResult<HostIdentity> {
    let (keypair, generated) = match secret {
        Some(bytes) => {
            let keypair = Keypair::ed25519_from_bytes(bytes.to_vec())
                .map_err(|e| P2pError::IdentityLoad(e.to_string()))?;
            (keypair, false)
        }
        None => (Keypair::generate_ed25519(), true),
    };
    let peer_id = keypair.public().to_peer_id();
    Ok(HostIdentity {
        keypair,
        peer_id,
        generated,
    })
}

/// Export the raw Ed25519 secret for persistence.
pub fn secret_bytes(keypair: &Keypair) -> P2pResult<Vec<u8>> {
    let ed25519 = keypair
        .clone()
        .try_into_ed25519()
        .map_err(|e| P2pError::IdentityGenerate(e.to_string()))?;
    Ok(ed25519.secret().as_ref().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_when_unconfigured() {
        let identity = load_or_generate(None).unwrap();
        assert!(identity.generated);
        assert_eq!(identity.peer_id, identity.keypair.public().to_peer_id());
    }

    #[test]
    fn loads_a_persisted_secret() {
        let first = load_or_generate(None).unwrap();
        let secret = secret_bytes(&first.keypair).unwrap();

        let second = load_or_generate(Some(&secret)).unwrap();
        assert!(!second.generated);
        assert_eq!(first.peer_id, second.peer_id);
    }

    #[test]
    fn rejects_garbage_secrets() {
        let err = load_or_generate(Some(&[1, 2, 3])).unwrap_err();
        assert!(matches!(err, P2pError::IdentityLoad(_)));
    }
}

//! SRP-6a client for Pair-Setup
//!
//! Parameters are fixed by the protocol: the RFC 5054 3072-bit group with
//! generator 5 and SHA-512 everywhere. All big-number operands that feed a
//! hash are left-padded to the 384-byte group size where Apple's
//! implementation pads them, and left raw where it does not.

use num_bigint::BigUint;
use num_traits::Zero;
use rand::RngCore;
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use crate::RemoteXpcError;

const GROUP_BYTES: usize = 384;

pub(crate) const N_3072_HEX: &[u8] = b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E08\
8A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B\
302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9\
A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE6\
49286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8\
FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D\
670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C\
180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D\
04507A33A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7D\
B3970F85A6E1E4C7ABF5AE8CDB0933D71E8C94E04A25619DCEE3D226\
1AD2EE6BF12FFA06D98A0864D87602733EC86A64521F2B18177B200C\
BBE117577A615D6C770988C0BAD946E208E24FA074E5AB3143DB5BFC\
E0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF";

fn pad_to_group(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() >= GROUP_BYTES {
        return bytes.to_vec();
    }
    let mut padded = vec![0u8; GROUP_BYTES];
    padded[GROUP_BYTES - bytes.len()..].copy_from_slice(bytes);
    padded
}

/// SRP-6a client session state
///
/// The client is fed credentials, salt and the server's public key, then
/// produces the client proof and session key. Secrets are zeroed when the
/// session is disposed or dropped.
pub struct SrpClient {
    n: BigUint,
    g: BigUint,
    k: BigUint,

    identity: Option<String>,
    pin: Option<String>,
    salt: Option<Vec<u8>>,
    server_public: Option<Vec<u8>>,

    a_private: Vec<u8>,
    public_key: Option<Vec<u8>>,
    proof: Option<Vec<u8>>,
    session_key: Option<Vec<u8>>,
}

impl std::fmt::Debug for SrpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrpClient")
            .field("identity", &self.identity)
            .field("has_salt", &self.salt.is_some())
            .field("has_server_public", &self.server_public.is_some())
            .finish()
    }
}

impl SrpClient {
    pub fn new() -> Self {
        let n = BigUint::parse_bytes(N_3072_HEX, 16).expect("group constant is valid hex");
        let g = BigUint::from(5u32);

        // k = H(N | pad(g))
        let k = {
            let mut hasher = Sha512::new();
            hasher.update(n.to_bytes_be());
            hasher.update(pad_to_group(&g.to_bytes_be()));
            BigUint::from_bytes_be(&hasher.finalize())
        };

        Self {
            n,
            g,
            k,
            identity: None,
            pin: None,
            salt: None,
            server_public: None,
            a_private: Vec::new(),
            public_key: None,
            proof: None,
            session_key: None,
        }
    }

    /// Records the authentication credentials
    pub fn set_identity(
        &mut self,
        user: impl Into<String>,
        pin: impl Into<String>,
    ) -> Result<(), RemoteXpcError> {
        let pin = pin.into();
        if pin.is_empty() {
            return Err(RemoteXpcError::InvalidArgument);
        }
        self.identity = Some(user.into());
        self.pin = Some(pin);
        Ok(())
    }

    pub fn set_salt(&mut self, salt: impl Into<Vec<u8>>) {
        self.salt = Some(salt.into());
        self.derive_ephemeral();
    }

    /// Records the server public key B, rejecting degenerate values
    pub fn set_server_public_key(&mut self, b: impl Into<Vec<u8>>) -> Result<(), RemoteXpcError> {
        let b = b.into();
        if b.len() != GROUP_BYTES {
            return Err(RemoteXpcError::InvalidServerKey);
        }
        if (BigUint::from_bytes_be(&b) % &self.n).is_zero() {
            return Err(RemoteXpcError::InvalidServerKey);
        }
        self.server_public = Some(b);
        self.derive_ephemeral();
        Ok(())
    }

    /// Once both salt and server key are present, derive (a, A)
    fn derive_ephemeral(&mut self) {
        if self.salt.is_none() || self.server_public.is_none() || self.public_key.is_some() {
            return;
        }
        let mut a = vec![0u8; GROUP_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut a);
        let a_int = BigUint::from_bytes_be(&a) % &self.n;
        let a_pub = self.g.modpow(&a_int, &self.n);
        self.a_private = a;
        self.public_key = Some(pad_to_group(&a_pub.to_bytes_be()));
    }

    /// The 384-byte client public ephemeral A
    pub fn public_key(&self) -> Option<&[u8]> {
        self.public_key.as_deref()
    }

    /// Computes the 64-byte client proof M1 and the session key K
    ///
    /// `M1 = H(H(N) ⊕ H(g) | H(I) | s | A | B | K)` where `K = H(S)` and
    /// `S = (B − k·g^x)^(a + u·x) mod N`.
    pub fn compute_proof(&mut self) -> Result<Vec<u8>, RemoteXpcError> {
        let identity = self
            .identity
            .as_ref()
            .ok_or(RemoteXpcError::MissingSrpData)?;
        let pin = self.pin.as_ref().ok_or(RemoteXpcError::MissingSrpData)?;
        let salt = self.salt.as_ref().ok_or(RemoteXpcError::MissingSrpData)?;
        let server_public = self
            .server_public
            .as_ref()
            .ok_or(RemoteXpcError::MissingSrpData)?;
        let public_key = self
            .public_key
            .as_ref()
            .ok_or(RemoteXpcError::MissingSrpData)?;

        let b_pub = BigUint::from_bytes_be(server_public);
        let a_int = BigUint::from_bytes_be(&self.a_private) % &self.n;

        // u = H(pad(A) | pad(B))
        let u = {
            let mut hasher = Sha512::new();
            hasher.update(public_key);
            hasher.update(pad_to_group(&b_pub.to_bytes_be()));
            BigUint::from_bytes_be(&hasher.finalize())
        };

        // x = H(s | H(I ":" pin))
        let mut x = {
            let mut inner = Sha512::new();
            inner.update(identity.as_bytes());
            inner.update(b":");
            inner.update(pin.as_bytes());
            let h_up = inner.finalize();

            let mut outer = Sha512::new();
            outer.update(salt);
            outer.update(h_up);
            BigUint::from_bytes_be(&outer.finalize())
        };

        // S = (B - k * g^x) ^ (a + u * x) mod N, kept non-negative
        let g_x = self.g.modpow(&x, &self.n);
        let k_g_x = (&self.k * g_x) % &self.n;
        let base = if b_pub >= k_g_x {
            (&b_pub - &k_g_x) % &self.n
        } else {
            (&self.n - (&k_g_x - &b_pub) % &self.n) % &self.n
        };
        let exp = &a_int + (&u * &x);
        let mut s_shared = base.modpow(&exp, &self.n);

        // K = H(S)
        let session_key = Sha512::digest(s_shared.to_bytes_be()).to_vec();

        // M1 = H(H(N) ^ H(g) | H(I) | s | A | B | K)
        let proof = {
            let hn = Sha512::digest(self.n.to_bytes_be());
            let hg = Sha512::digest(self.g.to_bytes_be());
            let mut hn_xor_hg = [0u8; 64];
            for i in 0..64 {
                hn_xor_hg[i] = hn[i] ^ hg[i];
            }

            let mut hasher = Sha512::new();
            hasher.update(hn_xor_hg);
            hasher.update(Sha512::digest(identity.as_bytes()));
            hasher.update(salt);
            hasher.update(public_key);
            hasher.update(b_pub.to_bytes_be());
            hasher.update(&session_key);
            hasher.finalize().to_vec()
        };

        // BigUint offers no in-place scrubbing; overwrite so the secret
        // intermediates do not outlive this call.
        x = BigUint::zero();
        s_shared = BigUint::zero();
        drop((x, s_shared));

        self.session_key = Some(session_key);
        self.proof = Some(proof.clone());
        Ok(proof)
    }

    /// The shared session key K; only valid after `compute_proof`
    pub fn session_key(&self) -> Result<&[u8], RemoteXpcError> {
        self.session_key
            .as_deref()
            .ok_or(RemoteXpcError::SrpSessionNotReady)
    }

    /// Verifies the server proof `M2 = H(A | M1 | K)`
    pub fn verify_server(&self, server_proof: &[u8]) -> Result<(), RemoteXpcError> {
        let proof = self
            .proof
            .as_ref()
            .ok_or(RemoteXpcError::SrpSessionNotReady)?;
        let session_key = self
            .session_key
            .as_ref()
            .ok_or(RemoteXpcError::SrpSessionNotReady)?;
        let public_key = self
            .public_key
            .as_ref()
            .ok_or(RemoteXpcError::SrpSessionNotReady)?;

        let mut hasher = Sha512::new();
        hasher.update(public_key);
        hasher.update(proof);
        hasher.update(session_key);
        let expected = hasher.finalize();

        if expected.as_slice() != server_proof {
            return Err(RemoteXpcError::SrpProofMismatch);
        }
        Ok(())
    }

    /// Zeroes the private ephemeral, session key and proof
    pub fn dispose(&mut self) {
        self.a_private.zeroize();
        if let Some(k) = self.session_key.as_mut() {
            k.zeroize();
        }
        if let Some(p) = self.proof.as_mut() {
            p.zeroize();
        }
        if let Some(p) = self.pin.as_mut() {
            p.zeroize();
        }
        self.session_key = None;
        self.proof = None;
        self.public_key = None;
    }
}

impl Default for SrpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SrpClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Computes the server side of the exchange with independent formulas
    /// so the client's math is exercised end to end.
    struct FakeServer {
        n: BigUint,
        g: BigUint,
        k: BigUint,
        salt: Vec<u8>,
        verifier: BigUint,
        b: BigUint,
        public: Vec<u8>,
    }

    impl FakeServer {
        fn new(identity: &str, pin: &str, salt: Vec<u8>) -> Self {
            let n = BigUint::parse_bytes(N_3072_HEX, 16).unwrap();
            let g = BigUint::from(5u32);
            let k = {
                let mut hasher = Sha512::new();
                hasher.update(n.to_bytes_be());
                hasher.update(pad_to_group(&g.to_bytes_be()));
                BigUint::from_bytes_be(&hasher.finalize())
            };

            let x = {
                let mut inner = Sha512::new();
                inner.update(identity.as_bytes());
                inner.update(b":");
                inner.update(pin.as_bytes());
                let h_up = inner.finalize();
                let mut outer = Sha512::new();
                outer.update(&salt);
                outer.update(h_up);
                BigUint::from_bytes_be(&outer.finalize())
            };
            let verifier = g.modpow(&x, &n);

            let b = BigUint::from(0xDEADBEEFu32);
            let public = {
                let gb = g.modpow(&b, &n);
                pad_to_group(&((&k * &verifier + gb) % &n).to_bytes_be())
            };

            Self {
                n,
                g: g.clone(),
                k,
                salt,
                verifier,
                b,
                public,
            }
        }

        fn session_key(&self, client_public: &[u8]) -> Vec<u8> {
            let a_pub = BigUint::from_bytes_be(client_public);
            let b_pub = BigUint::from_bytes_be(&self.public);
            let u = {
                let mut hasher = Sha512::new();
                hasher.update(pad_to_group(&a_pub.to_bytes_be()));
                hasher.update(pad_to_group(&b_pub.to_bytes_be()));
                BigUint::from_bytes_be(&hasher.finalize())
            };
            let s = (&a_pub * self.verifier.modpow(&u, &self.n) % &self.n).modpow(&self.b, &self.n);
            Sha512::digest(s.to_bytes_be()).to_vec()
        }

        fn server_proof(&self, client_public: &[u8], client_proof: &[u8]) -> Vec<u8> {
            let key = self.session_key(client_public);
            let mut hasher = Sha512::new();
            hasher.update(client_public);
            hasher.update(client_proof);
            hasher.update(key);
            hasher.finalize().to_vec()
        }
    }

    #[test]
    fn full_exchange_agrees_on_session_key() {
        let server = FakeServer::new("Pair-Setup", "031429", vec![0x42; 16]);

        let mut client = SrpClient::new();
        client.set_identity("Pair-Setup", "031429").unwrap();
        client.set_salt(server.salt.clone());
        client.set_server_public_key(server.public.clone()).unwrap();

        let a_pub = client.public_key().unwrap().to_vec();
        assert_eq!(a_pub.len(), GROUP_BYTES);

        let proof = client.compute_proof().unwrap();
        assert_eq!(proof.len(), 64);

        let key = client.session_key().unwrap().to_vec();
        assert_eq!(key.len(), 64);
        assert_eq!(key, server.session_key(&a_pub));

        let m2 = server.server_proof(&a_pub, &proof);
        client.verify_server(&m2).unwrap();
        assert!(matches!(
            client.verify_server(&[0u8; 64]),
            Err(RemoteXpcError::SrpProofMismatch)
        ));
    }

    #[test]
    fn degenerate_server_keys_are_rejected() {
        let mut client = SrpClient::new();
        client.set_identity("Pair-Setup", "000000").unwrap();
        client.set_salt(vec![0u8; 16]);

        // B = 0
        assert!(matches!(
            client.set_server_public_key(vec![0u8; GROUP_BYTES]),
            Err(RemoteXpcError::InvalidServerKey)
        ));

        // B = N
        let n = BigUint::parse_bytes(N_3072_HEX, 16).unwrap();
        assert!(matches!(
            client.set_server_public_key(pad_to_group(&n.to_bytes_be())),
            Err(RemoteXpcError::InvalidServerKey)
        ));

        // wrong length
        assert!(matches!(
            client.set_server_public_key(vec![1u8; 128]),
            Err(RemoteXpcError::InvalidServerKey)
        ));
    }

    #[test]
    fn empty_pin_is_rejected() {
        let mut client = SrpClient::new();
        assert!(matches!(
            client.set_identity("Pair-Setup", ""),
            Err(RemoteXpcError::InvalidArgument)
        ));
    }

    #[test]
    fn session_key_requires_proof_computation() {
        let client = SrpClient::new();
        assert!(matches!(
            client.session_key(),
            Err(RemoteXpcError::SrpSessionNotReady)
        ));
    }
}

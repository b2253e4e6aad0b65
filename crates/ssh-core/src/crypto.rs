use russh::{
    Preferred,
    keys::{Algorithm, HashAlg},
};
use std::borrow::Cow;

pub fn default_preferred() -> Preferred {
    Preferred::DEFAULT.clone()
}

/// Suites for old appliances that still speak SHA-1 key exchange and CBC ciphers.
pub fn legacy_preferred() -> Preferred {
    Preferred {
        kex: Cow::Owned(vec![russh::kex::CURVE25519, russh::kex::DH_G14_SHA1, russh::kex::DH_G1_SHA1]),
        key: Cow::Owned(vec![
            Algorithm::Ed25519,
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha512),
            },
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha256),
            },
            Algorithm::Rsa { hash: None },
        ]),
        cipher: Cow::Owned(vec![
            russh::cipher::CHACHA20_POLY1305,
            russh::cipher::AES_128_CTR,
            russh::cipher::AES_128_CBC,
        ]),
        mac: Cow::Owned(vec![russh::mac::HMAC_SHA256, russh::mac::HMAC_SHA512, russh::mac::HMAC_SHA1]),
        compression: Preferred::DEFAULT.compression,
    }
}

pub fn preferred_for(legacy: bool) -> Preferred {
    if legacy { legacy_preferred() } else { default_preferred() }
}

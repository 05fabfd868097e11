//! MySQL authentication plugins.
//!
//! - `mysql_native_password`: SHA1-based (legacy, MySQL < 8.0 default)
//! - `caching_sha2_password`: SHA256-based (MySQL 8.0+ default)
//! - `mysql_clear_password`: the password itself, only when explicitly enabled
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password
//!
//! Fast auth (if cached on server):
//! ```text
//! XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + nonce))
//! ```
//!
//! Full auth sends the password in clear, which is only done over TLS or a
//! unix socket.

use mywire_core::Result;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::auth_plugin_error;

/// Well-known authentication plugin names.
pub mod plugins {
    /// SHA1-based authentication (legacy default)
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    /// SHA256-based authentication (MySQL 8.0+ default)
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    /// Password sent as-is
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Tags used by the caching_sha2_password exchange.
pub mod caching_sha2 {
    /// Auth-more-data packet tag
    pub const MORE_DATA: u8 = 0x01;
    /// Fast auth success
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Full auth needed (send the password over a secure channel)
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// Drop the NUL the server appends to its challenge.
fn strip_nul(data: &[u8]) -> &[u8] {
    match data.split_last() {
        Some((&0, rest)) => rest,
        _ => data,
    }
}

fn xor<const N: usize>(a: [u8; N], b: [u8; N]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

/// Compute the mysql_native_password response.
///
/// Returns an empty response when the password is empty.
pub fn mysql_native_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let scramble = strip_nul(scramble);

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    xor(stage1, stage3)
}

/// Compute the caching_sha2_password fast-auth response.
///
/// Returns an empty response when the password is empty.
pub fn caching_sha2_password(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let nonce = strip_nul(nonce);

    let password_hash: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let password_hash_hash: [u8; 32] = Sha256::digest(password_hash).into();

    let mut hasher = Sha256::new();
    hasher.update(password_hash_hash);
    hasher.update(nonce);
    let scramble: [u8; 32] = hasher.finalize().into();

    xor(password_hash, scramble)
}

/// Compute the response `plugin` expects for `challenge`.
///
/// Unknown plugins and a disabled cleartext plugin are auth-plugin errors.
pub fn auth_response(
    plugin: &str,
    password: &str,
    challenge: &[u8],
    cleartext_enabled: bool,
) -> Result<Vec<u8>> {
    match plugin {
        plugins::MYSQL_NATIVE_PASSWORD => Ok(mysql_native_password(password, challenge)),
        plugins::CACHING_SHA2_PASSWORD => Ok(caching_sha2_password(password, challenge)),
        plugins::MYSQL_CLEAR_PASSWORD => {
            if cleartext_enabled {
                Ok(password.as_bytes().to_vec())
            } else {
                Err(auth_plugin_error("cleartext plugin not enabled"))
            }
        }
        other => Err(auth_plugin_error(format!(
            "unknown authentication plugin '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn scramble() -> Vec<u8> {
        (1u8..=20).collect()
    }

    #[test]
    fn test_mysql_native_password() {
        let response = mysql_native_password("secret", &scramble());
        assert_eq!(response, hex("b32bb3a583e1340c0a1108d58b1be49781ad8c2f"));
    }

    #[test]
    fn test_native_password_strips_nul() {
        let mut with_nul = scramble();
        with_nul.push(0);
        assert_eq!(
            mysql_native_password("secret", &with_nul),
            mysql_native_password("secret", &scramble())
        );
    }

    #[test]
    fn test_empty_password() {
        assert!(mysql_native_password("", &scramble()).is_empty());
        assert!(caching_sha2_password("", &scramble()).is_empty());
    }

    #[test]
    fn test_caching_sha2_password() {
        let mut nonce = scramble();
        nonce.push(0);
        let response = caching_sha2_password("secret", &nonce);
        assert_eq!(
            response,
            hex("746ebe205d56a0707acb3e796e834e0dd7b1d61743b26bd5202c7a623230c7c9")
        );
    }

    #[test]
    fn test_auth_response_dispatch() {
        let native = auth_response(plugins::MYSQL_NATIVE_PASSWORD, "secret", &scramble(), false)
            .unwrap();
        assert_eq!(native.len(), 20);

        let sha2 = auth_response(plugins::CACHING_SHA2_PASSWORD, "secret", &scramble(), false)
            .unwrap();
        assert_eq!(sha2.len(), 32);

        let clear = auth_response(plugins::MYSQL_CLEAR_PASSWORD, "secret", &[], true).unwrap();
        assert_eq!(clear, b"secret");
    }

    #[test]
    fn test_auth_response_rejections() {
        let err = auth_response(plugins::MYSQL_CLEAR_PASSWORD, "secret", &[], false).unwrap_err();
        assert!(err.is_auth_plugin_error());

        let err = auth_response("sha256_password", "secret", &scramble(), true).unwrap_err();
        assert!(err.is_auth_plugin_error());
    }
}

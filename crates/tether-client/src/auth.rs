// CONNECT credential fields: user/pass, token, NKey nonce signature, JWT.
//
// NKey seeds are base32 text carrying a prefix pair, the 32-byte Ed25519
// seed, and a CRC-16 check. Only the seed codec lives here; credentials
// *files* are parsed by the embedding application.
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use tether_wire::{ConnectInfo, ServerInfo};

use crate::config::ClientOptions;
use crate::{Error, Result};

/// Upper five bits marking a seed (`S...`).
const PREFIX_SEED: u8 = 18 << 3;
/// Public prefix for user keys (`U...`).
#[cfg(test)]
pub(crate) const PREFIX_USER: u8 = 20 << 3;

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Populate the credential fields of a CONNECT body from the configured
/// options and the server INFO. Fields without matching credentials stay
/// unset; the broker closes the connection if its policy is unmet.
pub(crate) fn fill_connect(
    opts: &ClientOptions,
    info: &ServerInfo,
    connect: &mut ConnectInfo,
) -> Result<()> {
    if let Some(user) = &opts.user {
        connect.user = Some(user.clone());
        connect.pass = opts.pass.clone();
    }
    if let Some(token) = &opts.token {
        connect.auth_token = Some(token.clone());
    }
    if let Some(seed) = &opts.nkey_seed {
        let (public_prefix, seed_bytes) = decode_seed(seed)?;
        let key = SigningKey::from_bytes(&seed_bytes);
        if let Some(nonce) = &info.nonce {
            let signature = key.sign(nonce.as_bytes());
            connect.sig = Some(URL_SAFE_NO_PAD.encode(signature.to_bytes()));
        }
        if opts.jwt.is_some() {
            connect.jwt = opts.jwt.clone();
        } else {
            connect.nkey = Some(opts.nkey.clone().unwrap_or_else(|| {
                encode_public(public_prefix, &key.verifying_key().to_bytes())
            }));
        }
    } else if let Some(jwt) = &opts.jwt {
        connect.jwt = Some(jwt.clone());
    } else if let Some(nkey) = &opts.nkey {
        connect.nkey = Some(nkey.clone());
    }
    Ok(())
}

/// Split a seed into its embedded public-key prefix and the raw Ed25519
/// seed bytes, verifying the checksum.
pub(crate) fn decode_seed(seed: &str) -> Result<(u8, [u8; 32])> {
    let raw = base32_decode(seed)?;
    if raw.len() != 2 + 32 + 2 {
        return Err(Error::Auth(format!(
            "seed has {} bytes, expected 36",
            raw.len()
        )));
    }
    let (payload, check) = raw.split_at(raw.len() - 2);
    let expected = u16::from_le_bytes([check[0], check[1]]);
    if crc16(payload) != expected {
        return Err(Error::Auth("seed checksum mismatch".to_string()));
    }
    if payload[0] & 0xf8 != PREFIX_SEED {
        return Err(Error::Auth("not a seed".to_string()));
    }
    let public_prefix = ((payload[0] & 0x07) << 5) | (payload[1] >> 3);
    let mut seed_bytes = [0u8; 32];
    seed_bytes.copy_from_slice(&payload[2..34]);
    Ok((public_prefix, seed_bytes))
}

/// Render a public key in NKey text form for the given prefix.
pub(crate) fn encode_public(public_prefix: u8, key: &[u8; 32]) -> String {
    let mut raw = Vec::with_capacity(1 + 32 + 2);
    raw.push(public_prefix);
    raw.extend_from_slice(key);
    let check = crc16(&raw);
    raw.extend_from_slice(&check.to_le_bytes());
    base32_encode(&raw)
}

#[cfg(test)]
pub(crate) fn encode_seed(public_prefix: u8, seed: &[u8; 32]) -> String {
    let mut raw = Vec::with_capacity(2 + 32 + 2);
    raw.push(PREFIX_SEED | (public_prefix >> 5));
    raw.push((public_prefix & 0x1f) << 3);
    raw.extend_from_slice(seed);
    let check = crc16(&raw);
    raw.extend_from_slice(&check.to_le_bytes());
    base32_encode(&raw)
}

// CRC-16/XMODEM, the checksum NKey text encoding carries.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut bits: u32 = 0;
    let mut bit_count = 0u32;
    for &byte in data {
        bits = (bits << 8) | u32::from(byte);
        bit_count += 8;
        while bit_count >= 5 {
            bit_count -= 5;
            out.push(BASE32_ALPHABET[((bits >> bit_count) & 0x1f) as usize] as char);
        }
    }
    if bit_count > 0 {
        out.push(BASE32_ALPHABET[((bits << (5 - bit_count)) & 0x1f) as usize] as char);
    }
    out
}

fn base32_decode(text: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len() * 5 / 8);
    let mut bits: u32 = 0;
    let mut bit_count = 0u32;
    for ch in text.bytes() {
        let value = BASE32_ALPHABET
            .iter()
            .position(|&c| c == ch)
            .ok_or_else(|| Error::Auth(format!("invalid seed character: {}", ch as char)))?;
        bits = (bits << 5) | value as u32;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    fn test_seed() -> (String, SigningKey) {
        let raw = [7u8; 32];
        (encode_seed(PREFIX_USER, &raw), SigningKey::from_bytes(&raw))
    }

    #[test]
    fn seed_text_round_trips() {
        let (seed, key) = test_seed();
        assert!(seed.starts_with("SU"), "user seed prefix, got {seed}");
        let (prefix, bytes) = decode_seed(&seed).expect("decode");
        assert_eq!(prefix, PREFIX_USER);
        assert_eq!(bytes, key.to_bytes());
    }

    #[test]
    fn public_key_renders_with_user_prefix() {
        let (_, key) = test_seed();
        let text = encode_public(PREFIX_USER, &key.verifying_key().to_bytes());
        assert!(text.starts_with('U'), "got {text}");
    }

    #[test]
    fn corrupted_seed_fails_checksum() {
        let (seed, _) = test_seed();
        let mut corrupted = seed.into_bytes();
        let last = corrupted.len() - 1;
        corrupted[last] = if corrupted[last] == b'A' { b'B' } else { b'A' };
        let corrupted = String::from_utf8(corrupted).expect("utf8");
        assert!(matches!(decode_seed(&corrupted), Err(Error::Auth(_))));
    }

    #[test]
    fn nonce_signature_verifies_under_derived_public_key() {
        let (seed, key) = test_seed();
        let opts = ClientOptions {
            nkey_seed: Some(seed),
            ..ClientOptions::default()
        };
        let info = ServerInfo {
            nonce: Some("abcnonce".to_string()),
            ..ServerInfo::default()
        };
        let mut connect = ConnectInfo::default();
        fill_connect(&opts, &info, &mut connect).expect("fill");

        let sig_b64 = connect.sig.expect("signature set");
        let sig_bytes = URL_SAFE_NO_PAD.decode(sig_b64).expect("base64");
        let signature = Signature::from_slice(&sig_bytes).expect("signature");
        let verifying = VerifyingKey::from_bytes(&key.verifying_key().to_bytes()).expect("key");
        verifying
            .verify(b"abcnonce", &signature)
            .expect("signature verifies");
        assert!(connect.nkey.expect("nkey set").starts_with('U'));
        assert!(connect.jwt.is_none());
    }

    #[test]
    fn jwt_with_seed_signs_but_omits_nkey() {
        let (seed, _) = test_seed();
        let opts = ClientOptions {
            nkey_seed: Some(seed),
            jwt: Some("ey.fake.jwt".to_string()),
            ..ClientOptions::default()
        };
        let info = ServerInfo {
            nonce: Some("n1".to_string()),
            ..ServerInfo::default()
        };
        let mut connect = ConnectInfo::default();
        fill_connect(&opts, &info, &mut connect).expect("fill");
        assert_eq!(connect.jwt.as_deref(), Some("ey.fake.jwt"));
        assert!(connect.nkey.is_none());
        assert!(connect.sig.is_some());
    }

    #[test]
    fn user_pass_and_token_fields() {
        let opts = ClientOptions {
            user: Some("svc".to_string()),
            pass: Some("secret".to_string()),
            token: Some("tok".to_string()),
            ..ClientOptions::default()
        };
        let mut connect = ConnectInfo::default();
        fill_connect(&opts, &ServerInfo::default(), &mut connect).expect("fill");
        assert_eq!(connect.user.as_deref(), Some("svc"));
        assert_eq!(connect.pass.as_deref(), Some("secret"));
        assert_eq!(connect.auth_token.as_deref(), Some("tok"));
        assert!(connect.sig.is_none());
    }

    #[test]
    fn no_credentials_leaves_fields_unset() {
        let mut connect = ConnectInfo::default();
        fill_connect(
            &ClientOptions::default(),
            &ServerInfo::default(),
            &mut connect,
        )
        .expect("fill");
        assert!(connect.user.is_none());
        assert!(connect.auth_token.is_none());
        assert!(connect.nkey.is_none());
        assert!(connect.sig.is_none());
    }
}

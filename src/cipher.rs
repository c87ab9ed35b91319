//! Symmetric packet protection for the SSH binary packet protocol.
//!
//! `aes128-ctr` with `hmac-sha2-256` (RFC 4344, RFC 6668), plugged into the
//! transport engine through [`TransportProtectionScheme`].

use aes::Aes128;
use bytes::{Buf, Bytes, BytesMut};
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::{fmt, sync::Arc};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

const BLOCK_SIZE: usize = 16;
const KEY_SIZE: usize = 16;
const MAC_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("invalid key size")]
    InvalidKeySize,

    #[error("encrypted packet length is not a multiple of the block size")]
    InvalidEncryptedPacketLength,

    #[error("decrypted plaintext is shorter than its padding")]
    InvalidDecryptedPlaintextLength,

    #[error("message authentication code mismatch")]
    InvalidMac,

    #[error("cryptographic primitive failure")]
    CryptographicError,
}

/// Keys derived by key exchange for one direction pair.
#[derive(Clone, Default)]
pub struct SessionKeys {
    pub initial_inbound_iv: Vec<u8>,
    pub initial_outbound_iv: Vec<u8>,
    pub inbound_encryption_key: Vec<u8>,
    pub outbound_encryption_key: Vec<u8>,
    pub inbound_mac_key: Vec<u8>,
    pub outbound_mac_key: Vec<u8>,
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.initial_inbound_iv.zeroize();
        self.initial_outbound_iv.zeroize();
        self.inbound_encryption_key.zeroize();
        self.outbound_encryption_key.zeroize();
        self.inbound_mac_key.zeroize();
        self.outbound_mac_key.zeroize();
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedKeySizes {
    pub iv_size: usize,
    pub encryption_key_size: usize,
    pub mac_key_size: usize,
}

/// Packet protection for one transport, in both directions.
///
/// Inbound packets arrive in two steps: the engine decrypts the first block
/// to learn the packet length, then hands over the whole packet (first block
/// already in plaintext, MAC appended).
pub trait TransportProtection: Send {
    fn cipher_name(&self) -> &'static str;

    fn mac_name(&self) -> Option<&'static str>;

    fn cipher_block_size(&self) -> usize;

    fn mac_bytes(&self) -> usize;

    /// Whether the packet length field is encrypted.
    fn length_encrypted(&self) -> bool;

    fn update_keys(&mut self, keys: &SessionKeys) -> Result<(), CipherError>;

    fn decrypt_first_block(&mut self, source: &mut [u8]) -> Result<(), CipherError>;

    /// Returns the payload with the length, padding length and padding stripped.
    fn decrypt_and_verify_remaining_packet(
        &mut self,
        source: &[u8],
        sequence_number: u32,
    ) -> Result<Bytes, CipherError>;

    /// Encrypt a padded plaintext packet in place and append its MAC.
    fn encrypt_packet(
        &mut self,
        destination: &mut BytesMut,
        sequence_number: u32,
    ) -> Result<(), CipherError>;
}

/// Creates [`TransportProtection`] instances once keys are known.
pub trait TransportProtectionFactory: Send + Sync + fmt::Debug {
    fn cipher_name(&self) -> &'static str;

    fn mac_name(&self) -> Option<&'static str>;

    fn key_sizes(&self) -> ExpectedKeySizes;

    fn create(&self, keys: &SessionKeys) -> Result<Box<dyn TransportProtection>, CipherError>;
}

/// A protection scheme offered to the transport engine.
#[derive(Debug, Clone)]
pub enum TransportProtectionScheme {
    /// `aes128-ctr` with `hmac-sha2-256`.
    Aes128Ctr,

    /// Whatever the engine supports on its own.
    Bundled,

    Custom(Arc<dyn TransportProtectionFactory>),
}

impl TransportProtectionScheme {
    /// The factory to register with the engine, or `None` for its built-in schemes.
    pub fn factory(&self) -> Option<Arc<dyn TransportProtectionFactory>> {
        match self {
            TransportProtectionScheme::Aes128Ctr => Some(Arc::new(Aes128CtrScheme)),
            TransportProtectionScheme::Bundled => None,
            TransportProtectionScheme::Custom(factory) => Some(factory.clone()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Aes128CtrScheme;

impl TransportProtectionFactory for Aes128CtrScheme {
    fn cipher_name(&self) -> &'static str {
        Aes128CtrHmacSha256::CIPHER_NAME
    }

    fn mac_name(&self) -> Option<&'static str> {
        Some(Aes128CtrHmacSha256::MAC_NAME)
    }

    fn key_sizes(&self) -> ExpectedKeySizes {
        ExpectedKeySizes {
            iv_size: BLOCK_SIZE,
            encryption_key_size: KEY_SIZE,
            mac_key_size: MAC_SIZE,
        }
    }

    fn create(&self, keys: &SessionKeys) -> Result<Box<dyn TransportProtection>, CipherError> {
        Ok(Box::new(Aes128CtrHmacSha256::new(keys)?))
    }
}

struct Direction {
    cipher: Aes128Ctr,
    mac: HmacSha256,
}

impl Direction {
    fn new(key: &[u8], iv: &[u8], mac_key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != KEY_SIZE || iv.len() != BLOCK_SIZE {
            return Err(CipherError::InvalidKeySize);
        }
        let cipher =
            Aes128Ctr::new_from_slices(key, iv).map_err(|_| CipherError::InvalidKeySize)?;
        let mac = HmacSha256::new_from_slice(mac_key).map_err(|_| CipherError::InvalidKeySize)?;
        Ok(Self { cipher, mac })
    }

    fn tag(&self, sequence_number: u32, plaintext: &[u8]) -> [u8; MAC_SIZE] {
        let mut mac = self.mac.clone();
        mac.update(&sequence_number.to_be_bytes());
        mac.update(plaintext);
        let mut tag = [0u8; MAC_SIZE];
        tag.copy_from_slice(&mac.finalize().into_bytes());
        tag
    }
}

pub struct Aes128CtrHmacSha256 {
    inbound: Direction,
    outbound: Direction,
}

impl fmt::Debug for Aes128CtrHmacSha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aes128CtrHmacSha256").finish_non_exhaustive()
    }
}

impl Aes128CtrHmacSha256 {
    pub const CIPHER_NAME: &'static str = "aes128-ctr";
    pub const MAC_NAME: &'static str = "hmac-sha2-256";

    pub fn new(keys: &SessionKeys) -> Result<Self, CipherError> {
        let inbound = Direction::new(
            &keys.inbound_encryption_key,
            &keys.initial_inbound_iv,
            &keys.inbound_mac_key,
        )?;
        let outbound = Direction::new(
            &keys.outbound_encryption_key,
            &keys.initial_outbound_iv,
            &keys.outbound_mac_key,
        )?;
        Ok(Self { inbound, outbound })
    }
}

impl TransportProtection for Aes128CtrHmacSha256 {
    fn cipher_name(&self) -> &'static str {
        Self::CIPHER_NAME
    }

    fn mac_name(&self) -> Option<&'static str> {
        Some(Self::MAC_NAME)
    }

    fn cipher_block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn mac_bytes(&self) -> usize {
        MAC_SIZE
    }

    fn length_encrypted(&self) -> bool {
        true
    }

    fn update_keys(&mut self, keys: &SessionKeys) -> Result<(), CipherError> {
        // both directions are built before either is replaced
        let fresh = Self::new(keys)?;
        *self = fresh;
        Ok(())
    }

    fn decrypt_first_block(&mut self, source: &mut [u8]) -> Result<(), CipherError> {
        if source.len() < BLOCK_SIZE {
            return Err(CipherError::InvalidEncryptedPacketLength);
        }
        self.inbound.cipher.apply_keystream(&mut source[..BLOCK_SIZE]);
        Ok(())
    }

    fn decrypt_and_verify_remaining_packet(
        &mut self,
        source: &[u8],
        sequence_number: u32,
    ) -> Result<Bytes, CipherError> {
        if source.len() < BLOCK_SIZE + MAC_SIZE {
            return Err(CipherError::InvalidEncryptedPacketLength);
        }
        let (packet, tag) = source.split_at(source.len() - MAC_SIZE);
        if packet.len() % BLOCK_SIZE != 0 {
            return Err(CipherError::InvalidEncryptedPacketLength);
        }

        let mut plaintext = BytesMut::from(packet);
        self.inbound
            .cipher
            .apply_keystream(&mut plaintext[BLOCK_SIZE..]);

        let expected = self.inbound.tag(sequence_number, &plaintext);
        if !bool::from(expected[..].ct_eq(tag)) {
            return Err(CipherError::InvalidMac);
        }

        plaintext.advance(4);
        let padding = plaintext.get_u8() as usize;
        if padding >= plaintext.len() {
            return Err(CipherError::InvalidDecryptedPlaintextLength);
        }
        plaintext.truncate(plaintext.len() - padding);

        Ok(plaintext.freeze())
    }

    fn encrypt_packet(
        &mut self,
        destination: &mut BytesMut,
        sequence_number: u32,
    ) -> Result<(), CipherError> {
        if destination.is_empty() || destination.len() % BLOCK_SIZE != 0 {
            return Err(CipherError::InvalidEncryptedPacketLength);
        }
        let tag = self.outbound.tag(sequence_number, &destination[..]);
        self.outbound.cipher.apply_keystream(&mut destination[..]);
        destination.extend_from_slice(&tag);
        Ok(())
    }
}

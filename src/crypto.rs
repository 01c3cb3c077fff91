//! In-place packet encryption.
//!
//! Packets are encrypted with AES over whole 16-byte blocks. The cipher is
//! consumed, not designed: key schedule and block transform come from the
//! `aes` crate. Payloads are right-padded with zeros to block alignment
//! before either operation, so the padded length is what travels on the
//! wire; receivers that know the plaintext length strip the padding
//! themselves.
//!
//! Both operations come in a blocking flavor (runs on the calling thread)
//! and a background flavor: the buffer moves to a worker thread and the
//! owning packet stays *busy* until the task is polled to completion.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use std::sync::mpsc;

use crate::error::{NetError, Result};

/// AES block size; packet payloads are padded to a multiple of this.
pub const BLOCK_SIZE: usize = 16;

/// A symmetric packet key. 128, 192 and 256 bit key material is accepted.
#[derive(Clone)]
pub struct CipherKey {
    material: KeyMaterial,
}

#[derive(Clone)]
enum KeyMaterial {
    Aes128([u8; 16]),
    Aes192([u8; 24]),
    Aes256([u8; 32]),
}

impl CipherKey {
    /// Build a key from raw material. The slice length selects the AES
    /// variant: 16, 24 or 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let material = match bytes.len() {
            16 => KeyMaterial::Aes128(bytes.try_into().unwrap()),
            24 => KeyMaterial::Aes192(bytes.try_into().unwrap()),
            32 => KeyMaterial::Aes256(bytes.try_into().unwrap()),
            n => {
                return Err(NetError::InvalidProfile(format!(
                    "cipher key must be 16, 24 or 32 bytes, got {n}"
                )))
            }
        };
        Ok(CipherKey { material })
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bits = match self.material {
            KeyMaterial::Aes128(_) => 128,
            KeyMaterial::Aes192(_) => 192,
            KeyMaterial::Aes256(_) => 256,
        };
        // Key material never appears in logs.
        write!(f, "CipherKey({bits} bit)")
    }
}

/// Zero-pad `data` up to the next block boundary.
pub(crate) fn pad_to_block(data: &mut Vec<u8>) {
    let rem = data.len() % BLOCK_SIZE;
    if rem != 0 {
        data.resize(data.len() + (BLOCK_SIZE - rem), 0);
    }
}

fn encrypt_blocks<A: BlockEncrypt>(cipher: &A, data: &mut [u8]) {
    debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
    for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
}

fn decrypt_blocks<A: BlockDecrypt>(cipher: &A, data: &mut [u8]) {
    debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
    for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
}

/// Encrypt `data` in place, padding to block alignment first.
pub(crate) fn encrypt_in_place(key: &CipherKey, data: &mut Vec<u8>) {
    pad_to_block(data);
    match &key.material {
        KeyMaterial::Aes128(k) => {
            encrypt_blocks(&Aes128::new(GenericArray::from_slice(k)), data)
        }
        KeyMaterial::Aes192(k) => {
            encrypt_blocks(&Aes192::new(GenericArray::from_slice(k)), data)
        }
        KeyMaterial::Aes256(k) => {
            encrypt_blocks(&Aes256::new(GenericArray::from_slice(k)), data)
        }
    }
}

/// Decrypt `data` in place, padding to block alignment first.
pub(crate) fn decrypt_in_place(key: &CipherKey, data: &mut Vec<u8>) {
    pad_to_block(data);
    match &key.material {
        KeyMaterial::Aes128(k) => {
            decrypt_blocks(&Aes128::new(GenericArray::from_slice(k)), data)
        }
        KeyMaterial::Aes192(k) => {
            decrypt_blocks(&Aes192::new(GenericArray::from_slice(k)), data)
        }
        KeyMaterial::Aes256(k) => {
            decrypt_blocks(&Aes256::new(GenericArray::from_slice(k)), data)
        }
    }
}

/// Direction of a cipher task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CipherOp {
    Encrypt,
    Decrypt,
}

/// Outcome of polling an asynchronous cipher task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherStatus {
    /// The task is still running; the packet remains busy.
    Pending,
    /// The task finished and the packet holds the transformed bytes.
    Done,
    /// The worker died; the packet is empty and idle again.
    Failed,
}

/// A single outstanding background encrypt/decrypt. The owning packet's
/// buffer lives inside the task until completion.
pub(crate) struct CipherTask {
    rx: mpsc::Receiver<Vec<u8>>,
}

pub(crate) enum TaskPoll {
    Pending,
    Ready(Vec<u8>),
    Failed,
}

impl CipherTask {
    /// Move `data` to a worker thread and transform it there.
    pub(crate) fn spawn(key: CipherKey, mut data: Vec<u8>, op: CipherOp) -> CipherTask {
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("msglink-cipher".into())
            .spawn(move || {
                match op {
                    CipherOp::Encrypt => encrypt_in_place(&key, &mut data),
                    CipherOp::Decrypt => decrypt_in_place(&key, &mut data),
                }
                // Receiver may be gone if the packet was dropped while busy.
                let _ = tx.send(data);
            })
            .expect("spawn cipher worker");
        CipherTask { rx }
    }

    pub(crate) fn poll(&mut self) -> TaskPoll {
        match self.rx.try_recv() {
            Ok(data) => TaskPoll::Ready(data),
            Err(mpsc::TryRecvError::Empty) => TaskPoll::Pending,
            Err(mpsc::TryRecvError::Disconnected) => TaskPoll::Failed,
        }
    }

    /// Block until the task finishes.
    pub(crate) fn wait(&mut self) -> TaskPoll {
        match self.rx.recv() {
            Ok(data) => TaskPoll::Ready(data),
            Err(_) => TaskPoll::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key256() -> CipherKey {
        CipherKey::from_bytes(&[7u8; 32]).unwrap()
    }

    #[test]
    fn key_length_validation() {
        assert!(CipherKey::from_bytes(&[0; 16]).is_ok());
        assert!(CipherKey::from_bytes(&[0; 24]).is_ok());
        assert!(CipherKey::from_bytes(&[0; 32]).is_ok());
        assert!(CipherKey::from_bytes(&[0; 15]).is_err());
        assert!(CipherKey::from_bytes(&[0; 33]).is_err());
    }

    #[test]
    fn round_trip_all_key_sizes() {
        for len in [16usize, 24, 32] {
            let key = CipherKey::from_bytes(&vec![9u8; len]).unwrap();
            let plain: Vec<u8> = (0..48).collect();
            let mut data = plain.clone();
            encrypt_in_place(&key, &mut data);
            assert_ne!(data, plain);
            decrypt_in_place(&key, &mut data);
            assert_eq!(data, plain);
        }
    }

    #[test]
    fn padding_extends_to_block_boundary() {
        let key = key256();
        let mut data = vec![1u8; 21];
        encrypt_in_place(&key, &mut data);
        assert_eq!(data.len(), 32);
        decrypt_in_place(&key, &mut data);
        assert_eq!(&data[..21], &[1u8; 21][..]);
        assert_eq!(&data[21..], &[0u8; 11][..]);
    }

    #[test]
    fn wrong_key_does_not_round_trip() {
        let mut data = vec![5u8; 16];
        encrypt_in_place(&key256(), &mut data);
        decrypt_in_place(&CipherKey::from_bytes(&[8u8; 32]).unwrap(), &mut data);
        assert_ne!(data, vec![5u8; 16]);
    }

    #[test]
    fn background_task_round_trip() {
        let key = key256();
        let plain = vec![3u8; 64];
        let mut task = CipherTask::spawn(key.clone(), plain.clone(), CipherOp::Encrypt);
        let encrypted = match task.wait() {
            TaskPoll::Ready(data) => data,
            _ => panic!("cipher task failed"),
        };
        assert_ne!(encrypted, plain);
        let mut task = CipherTask::spawn(key, encrypted, CipherOp::Decrypt);
        match task.wait() {
            TaskPoll::Ready(data) => assert_eq!(data, plain),
            _ => panic!("cipher task failed"),
        }
    }
}

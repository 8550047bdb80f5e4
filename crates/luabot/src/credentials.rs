//! Platform credential store for packed bot tokens.
//!
//! A project archive may carry the bot token encrypted with a key bound to
//! the machine (or user) that packed it. Only Windows provides such a store
//! today, through the Data Protection API. Elsewhere [`UnavailableStore`]
//! refuses both directions and packed tokens must be supplied externally.

/// Error type for credential operations.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// No credential store exists on this platform.
    #[error("no credential store is available on this platform ({0})")]
    Unavailable(&'static str),

    /// Encryption failed.
    #[error("failed to encrypt credential: {0}")]
    Encrypt(String),

    /// Decryption failed, typically because the blob was sealed elsewhere.
    #[error("failed to decrypt credential: {0}")]
    Decrypt(String),
}

/// Encrypts and decrypts small secrets.
pub trait CredentialStore: Send + Sync {
    /// Seal `plain`.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform refuses to encrypt.
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CredentialError>;

    /// Open a blob produced by [`CredentialStore::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns an error if the blob cannot be opened here.
    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CredentialError>;
}

/// Store used where the platform offers none.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableStore;

impl CredentialStore for UnavailableStore {
    fn encrypt(&self, _plain: &[u8]) -> Result<Vec<u8>, CredentialError> {
        Err(CredentialError::Unavailable(std::env::consts::OS))
    }

    fn decrypt(&self, _sealed: &[u8]) -> Result<Vec<u8>, CredentialError> {
        Err(CredentialError::Unavailable(std::env::consts::OS))
    }
}

/// The credential store of the running platform.
#[must_use]
pub fn platform_store() -> Box<dyn CredentialStore> {
    #[cfg(windows)]
    return Box::new(DpapiStore);

    #[cfg(not(windows))]
    Box::new(UnavailableStore)
}

#[cfg(windows)]
pub use dpapi::DpapiStore;

#[cfg(windows)]
mod dpapi {
    use windows::Win32::Foundation::{HLOCAL, LocalFree};
    use windows::Win32::Security::Cryptography::{
        CRYPT_INTEGER_BLOB, CryptProtectData, CryptUnprotectData,
    };
    use windows::core::w;

    use super::{CredentialError, CredentialStore};

    /// Windows Data Protection API, scoped to the current user.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct DpapiStore;

    impl CredentialStore for DpapiStore {
        #[allow(unsafe_code)]
        fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CredentialError> {
            let input = blob_of(plain)?;
            let mut output = CRYPT_INTEGER_BLOB::default();

            // SAFETY: `input` borrows `plain` for the duration of the call and
            // `output` is freed by `take_blob`.
            unsafe {
                CryptProtectData(
                    &input,
                    w!("Packed bot Telegram API Key"),
                    None,
                    None,
                    None,
                    0,
                    &mut output,
                )
            }
            .map_err(|e| CredentialError::Encrypt(e.to_string()))?;

            Ok(take_blob(output))
        }

        #[allow(unsafe_code)]
        fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CredentialError> {
            let input = blob_of(sealed)?;
            let mut output = CRYPT_INTEGER_BLOB::default();

            // SAFETY: as in `encrypt`; the description is not requested.
            unsafe { CryptUnprotectData(&input, None, None, None, None, 0, &mut output) }
                .map_err(|e| CredentialError::Decrypt(e.to_string()))?;

            Ok(take_blob(output))
        }
    }

    fn blob_of(bytes: &[u8]) -> Result<CRYPT_INTEGER_BLOB, CredentialError> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| CredentialError::Encrypt("credential is too large".to_string()))?;
        Ok(CRYPT_INTEGER_BLOB {
            cbData: len,
            pbData: bytes.as_ptr().cast_mut(),
        })
    }

    /// Copy a DPAPI output blob and release its buffer.
    #[allow(unsafe_code)]
    fn take_blob(blob: CRYPT_INTEGER_BLOB) -> Vec<u8> {
        if blob.pbData.is_null() {
            return Vec::new();
        }
        // SAFETY: DPAPI returned `cbData` initialised bytes at `pbData`,
        // allocated with LocalAlloc.
        unsafe {
            let bytes = std::slice::from_raw_parts(blob.pbData, blob.cbData as usize).to_vec();
            std::ptr::write_bytes(blob.pbData, 0, blob.cbData as usize);
            let _ = LocalFree(HLOCAL(blob.pbData.cast()));
            bytes
        }
    }

    #[cfg(test)]
    #[allow(clippy::expect_used)]
    mod tests {
        use super::*;

        #[test]
        fn sealed_token_opens_on_the_same_machine() {
            let store = DpapiStore;
            let sealed = store.encrypt(b"123:abc").expect("encrypt");
            assert_ne!(sealed, b"123:abc");
            assert_eq!(store.decrypt(&sealed).expect("decrypt"), b"123:abc");
        }

        #[test]
        fn garbage_does_not_open() {
            assert!(DpapiStore.decrypt(b"not a dpapi blob").is_err());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_store_refuses_both_directions() {
        let store = UnavailableStore;
        assert!(matches!(
            store.encrypt(b"token"),
            Err(CredentialError::Unavailable(_))
        ));
        assert!(matches!(
            store.decrypt(b"blob"),
            Err(CredentialError::Unavailable(_))
        ));
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later

//! Move-only, zeroize-on-drop byte string for passwords and authentication
//! keys (spec §3, §5).

use zeroize::ZeroizeOnDrop;

/// A byte string that is wiped when dropped and cannot be implicitly
/// cloned -- callers that genuinely need a copy call [`SecureBytes::clone_explicit`].
#[derive(ZeroizeOnDrop)]
pub struct SecureBytes(Vec<u8>);

impl SecureBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Explicit copy -- named to make a key/password duplication visible at
    /// the call site instead of happening implicitly via `#[derive(Clone)]`.
    pub fn clone_explicit(&self) -> Self {
        Self(self.0.clone())
    }
}

impl std::fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureBytes({} bytes, redacted)", self.0.len())
    }
}

impl From<Vec<u8>> for SecureBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl PartialEq for SecureBytes {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_leaks_content() {
        let secret = SecureBytes::new(b"hunter2".to_vec());
        assert!(!format!("{secret:?}").contains("hunter2"));
    }

    #[test]
    fn zeroizes_backing_buffer_on_drop() {
        let mut raw = vec![1u8, 2, 3, 4];
        let ptr = raw.as_mut_ptr();
        let len = raw.len();
        {
            let secret = SecureBytes::new(raw);
            drop(secret);
        }
        // SAFETY: the Vec's allocation is still valid (not freed, only the
        // SecureBytes wrapper was dropped after zeroizing it in place);
        // reading it back is only done here to assert the wipe happened.
        let after = unsafe { std::slice::from_raw_parts(ptr, len) };
        assert_eq!(after, [0, 0, 0, 0]);
    }
}

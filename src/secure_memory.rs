//! Secure Memory Handling Utilities
//!
//! Raw and derived key material only ever lives inside [`SecureBytes`], which
//! zeroes its buffer on drop and never prints its contents. Comparisons are
//! constant time.

use std::fmt;

use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A container for sensitive bytes that is zeroed when dropped.
///
/// # Security Properties
///
/// 1. Memory is zeroed on drop, including on early return and unwinding
/// 2. `Debug` output is redacted
/// 3. Equality is evaluated in constant time
///
/// # Example
///
/// ```
/// use tks::secure_memory::SecureBytes;
///
/// let key = SecureBytes::new(&[0x40, 0x41, 0x42, 0x43]);
/// assert_eq!(key.len(), 4);
/// assert_eq!(format!("{:?}", key), "SecureBytes([REDACTED; 4])");
/// ```
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureBytes {
    bytes: Vec<u8>,
}

impl SecureBytes {
    /// Copy `data` into a new secure container
    pub fn new(data: &[u8]) -> Self {
        Self {
            bytes: data.to_vec(),
        }
    }

    /// Allocate a zero-filled container of `len` bytes
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0u8; len],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Append data to the end of the buffer.
    ///
    /// Reserves up front so the old allocation is not left behind unzeroed
    /// by a reallocation.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        if self.bytes.capacity() - self.bytes.len() < data.len() {
            let mut grown = Vec::with_capacity(self.bytes.len() + data.len());
            grown.extend_from_slice(&self.bytes);
            self.bytes.zeroize();
            self.bytes = grown;
        }
        self.bytes.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Vec<u8>> for SecureBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl From<&[u8]> for SecureBytes {
    fn from(data: &[u8]) -> Self {
        Self::new(data)
    }
}

impl AsRef<[u8]> for SecureBytes {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl PartialEq for SecureBytes {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.len() == other.bytes.len() && bool::from(self.bytes.ct_eq(&other.bytes))
    }
}

impl Eq for SecureBytes {}

impl fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBytes([REDACTED; {}])", self.bytes.len())
    }
}

/// Run `f` with access to `data`, zeroing `data` afterwards.
///
/// The zeroing happens in a guard's `Drop`, so it also runs when `f`
/// returns early or panics.
///
/// # Example
///
/// ```
/// use tks::secure_memory::with_secure_scope;
///
/// let mut block = [0x5Au8; 16];
/// let sum: u32 = with_secure_scope(&mut block, |b| b.iter().map(|&x| x as u32).sum());
/// assert_eq!(sum, 0x5A * 16);
/// assert_eq!(block, [0u8; 16]);
/// ```
pub fn with_secure_scope<T, F, R>(data: &mut T, f: F) -> R
where
    T: Zeroize,
    F: FnOnce(&mut T) -> R,
{
    struct ScopeGuard<'a, T: Zeroize> {
        data: &'a mut T,
    }

    impl<T: Zeroize> Drop for ScopeGuard<'_, T> {
        fn drop(&mut self) {
            self.data.zeroize();
        }
    }

    let guard = ScopeGuard { data };
    f(&mut *guard.data)
}

//! User Copy - Fault-Aware User Buffer Wrappers
//!
//! User-facing reads and writes move data through these wrappers instead of
//! raw slices. A wrapper knows how far into the user buffer accesses
//! succeed; a copy that runs past that point transfers the valid prefix and
//! reports a fault, so callers can return partial progress.

use crate::error::{VmError, VmResult};

/// Result of a single copy: status and bytes transferred
pub type CopyOutcome = (VmResult<()>, usize);

fn copy_window(valid_len: usize, pos: usize, want: usize) -> (usize, bool) {
    let available = valid_len.saturating_sub(pos);
    if want <= available {
        (want, false)
    } else {
        (available, true)
    }
}

// ============================================================================
// UserOutPtr
// ============================================================================

/// Destination buffer in user memory
pub struct UserOutPtr<'a> {
    buf: &'a mut [u8],
    /// Bytes before the first faulting address
    valid_len: usize,
}

impl<'a> UserOutPtr<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        let valid_len = buf.len();
        Self { buf, valid_len }
    }

    /// Buffer whose accesses fault at `fault_at` bytes in
    pub fn with_fault_at(buf: &'a mut [u8], fault_at: usize) -> Self {
        let valid_len = fault_at.min(buf.len());
        Self { buf, valid_len }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Copy `src` to `pos` in the user buffer
    pub fn copy_to_user(&mut self, pos: usize, src: &[u8]) -> CopyOutcome {
        let (count, faulted) = copy_window(self.valid_len, pos, src.len());
        if count > 0 {
            self.buf[pos..pos + count].copy_from_slice(&src[..count]);
        }
        if faulted {
            log::debug!("copy to user faulted at {:#x}", pos + count);
            return (Err(VmError::InvalidArgs), count);
        }
        (Ok(()), count)
    }
}

// ============================================================================
// UserInPtr
// ============================================================================

/// Source buffer in user memory
pub struct UserInPtr<'a> {
    buf: &'a [u8],
    valid_len: usize,
}

impl<'a> UserInPtr<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            valid_len: buf.len(),
        }
    }

    pub fn with_fault_at(buf: &'a [u8], fault_at: usize) -> Self {
        Self {
            buf,
            valid_len: fault_at.min(buf.len()),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Copy from `pos` in the user buffer into `dst`
    pub fn copy_from_user(&self, pos: usize, dst: &mut [u8]) -> CopyOutcome {
        let (count, faulted) = copy_window(self.valid_len, pos, dst.len());
        if count > 0 {
            dst[..count].copy_from_slice(&self.buf[pos..pos + count]);
        }
        if faulted {
            log::debug!("copy from user faulted at {:#x}", pos + count);
            return (Err(VmError::InvalidArgs), count);
        }
        (Ok(()), count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_to_user_partial() {
        let mut buf = [0u8; 8];
        let mut out = UserOutPtr::with_fault_at(&mut buf, 5);
        assert_eq!(out.copy_to_user(0, &[1, 2, 3]), (Ok(()), 3));
        assert_eq!(out.copy_to_user(3, &[4, 5, 6, 7]), (Err(VmError::InvalidArgs), 2));
        assert_eq!(buf, [1, 2, 3, 4, 5, 0, 0, 0]);
    }

    #[test]
    fn test_copy_from_user_past_fault() {
        let src = [9u8; 16];
        let input = UserInPtr::with_fault_at(&src, 4);
        let mut dst = [0u8; 8];
        assert_eq!(input.copy_from_user(6, &mut dst), (Err(VmError::InvalidArgs), 0));
        assert_eq!(input.copy_from_user(0, &mut dst), (Err(VmError::InvalidArgs), 4));
        assert_eq!(&dst[..5], &[9, 9, 9, 9, 0]);
    }
}

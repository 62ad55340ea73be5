//! Fast non-cryptographic hashing of byte buffers

/// Hash a byte buffer into a 32-bit signed integer.
///
/// This is the `hash * 31 + byte` rolling hash with 32-bit wrap-around. The
/// exact algorithm matters: its output is persisted alongside stored license
/// sessions and compared on later loads.
pub fn hash_buffer(buffer: &[u8]) -> i32 {
    buffer.iter().fold(0i32, |hash, &byte| {
        (hash << 5).wrapping_sub(hash).wrapping_add(byte as i32)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_buffer() {
        assert_eq!(hash_buffer(&[]), 0);
    }

    #[test]
    fn test_known_values() {
        assert_eq!(hash_buffer(&[1]), 1);
        assert_eq!(hash_buffer(&[1, 2]), 33);
        assert_eq!(hash_buffer(b"abc"), 96354);
    }

    #[test]
    fn test_wraps_instead_of_overflowing() {
        let data = vec![0xffu8; 4096];
        let first = hash_buffer(&data);
        assert_eq!(first, hash_buffer(&data));
        assert_ne!(first, hash_buffer(&data[1..]));
    }
}

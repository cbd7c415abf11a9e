//! Shared frame builders for integration tests

#![allow(dead_code)]

/// Semi-planar 4:2:0 frame with constant Y, U and V
pub fn uniform_nv12(width: usize, height: usize, y: u8, u: u8, v: u8) -> Vec<u8> {
    let luma = width * height;
    let mut data = vec![y; luma + luma / 2];
    for pair in data[luma..].chunks_exact_mut(2) {
        pair[0] = u;
        pair[1] = v;
    }
    data
}

/// Frame with a deterministic pseudo-random pattern
pub fn patterned_nv12(width: usize, height: usize, seed: u32) -> Vec<u8> {
    let len = width * height * 3 / 2;
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state & 0xff) as u8
        })
        .collect()
}

pub const METADATA: &[u8] = b"\x08\x01\x10\x02";

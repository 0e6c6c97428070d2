// vim: tw=80
//! GF(2^8) arithmetic for the Q parity column
//!
//! Field polynomial x^8 + x^4 + x^3 + x^2 + 1 (0x11d), generator 2.  Data
//! index `i` contributes to Q with coefficient `2^i`.

const POLY: u32 = 0x11d;

const LOG: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut val = 1u32;
    let mut i = 0u32;
    while i < 255 {
        table[val as usize] = i as u8;
        val <<= 1;
        if val >= 256 {
            val ^= POLY;
        }
        i += 1;
    }
    table
};

// Doubled so that `EXP[log a + log b]` never needs a modulus
const EXP: [u8; 512] = {
    let mut table = [0u8; 512];
    let mut val = 1u32;
    let mut i = 0;
    while i < 512 {
        table[i] = val as u8;
        val <<= 1;
        if val >= 256 {
            val ^= POLY;
        }
        i += 1;
    }
    table
};

pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    EXP[LOG[a as usize] as usize + LOG[b as usize] as usize]
}

/// Multiplicative inverse.  `a` must not be zero.
pub fn inv(a: u8) -> u8 {
    debug_assert_ne!(a, 0);
    EXP[255 - LOG[a as usize] as usize]
}

pub fn div(a: u8, b: u8) -> u8 {
    mul(a, inv(b))
}

/// `2^e`
pub fn exp2(e: usize) -> u8 {
    EXP[e % 255]
}

pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= s;
    }
}

/// `dst ^= coeff * src`, bytewise
pub fn mul_xor_into(dst: &mut [u8], src: &[u8], coeff: u8) {
    match coeff {
        0 => (),
        1 => xor_into(dst, src),
        _ => {
            let lc = LOG[coeff as usize] as usize;
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                if *s != 0 {
                    *d ^= EXP[LOG[*s as usize] as usize + lc];
                }
            }
        }
    }
}

/// `buf *= coeff`, bytewise
pub fn scale(buf: &mut [u8], coeff: u8) {
    for b in buf.iter_mut() {
        *b = mul(*b, coeff);
    }
}

// LCOV_EXCL_STOP

//! GF(2^8) arithmetic with the primitive polynomial x^8 + x^4 + x^3 + x^2 + 1
//! (0x11D) and generator α = 2.
//!
//! Addition and subtraction are both XOR.  Multiplication goes through
//! log/antilog tables built at compile time; the antilog table is doubled
//! so `EXP[LOG[a] + LOG[b]]` never needs a modulo.

const PRIMITIVE_POLY: u16 = 0x11D;

const fn build_exp() -> [u8; 512] {
    let mut exp = [0u8; 512];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= PRIMITIVE_POLY;
        }
        i += 1;
    }
    while i < 512 {
        exp[i] = exp[i - 255];
        i += 1;
    }
    exp
}

const fn build_log(exp: &[u8; 512]) -> [u8; 256] {
    let mut log = [0u8; 256];
    let mut i = 0;
    while i < 255 {
        log[exp[i] as usize] = i as u8;
        i += 1;
    }
    log
}

const EXP_TABLE: [u8; 512] = build_exp();

static EXP: [u8; 512] = EXP_TABLE;
static LOG: [u8; 256] = build_log(&EXP_TABLE);

#[inline]
pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    EXP[LOG[a as usize] as usize + LOG[b as usize] as usize]
}

/// Multiplicative inverse.  `a` must be non-zero.
#[inline]
pub fn inv(a: u8) -> u8 {
    debug_assert!(a != 0, "zero has no inverse in GF(256)");
    EXP[255 - LOG[a as usize] as usize]
}

#[inline]
pub fn div(a: u8, b: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    mul(a, inv(b))
}

/// α^e for any non-negative exponent.
#[inline]
pub fn alpha_pow(e: usize) -> u8 {
    EXP[e % 255]
}

/// α^(-e).
#[inline]
pub fn alpha_pow_neg(e: usize) -> u8 {
    EXP[(255 - e % 255) % 255]
}

// ── Polynomials ──────────────────────────────────────────────────────────────
//
// Two coefficient orders are used by the Reed-Solomon code:
//   * "high-first" for codewords and the generator (index 0 = x^(n-1));
//   * "low-first" for syndromes and locator polynomials (index i = x^i).
// Each helper states which one it expects.

/// Evaluate a high-first polynomial at `x` (Horner).
pub fn eval_high_first(poly: &[u8], x: u8) -> u8 {
    let mut y = 0u8;
    for &c in poly {
        y = mul(y, x) ^ c;
    }
    y
}

/// Evaluate a low-first polynomial at `x`.
pub fn eval_low_first(poly: &[u8], x: u8) -> u8 {
    let mut y = 0u8;
    for &c in poly.iter().rev() {
        y = mul(y, x) ^ c;
    }
    y
}

/// Product of two polynomials; works for either order as long as both
/// operands use the same one.
pub fn poly_mul(a: &[u8], b: &[u8]) -> Vec<u8> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let mut out = vec![0u8; a.len() + b.len() - 1];
    for (i, &ai) in a.iter().enumerate() {
        if ai == 0 {
            continue;
        }
        for (j, &bj) in b.iter().enumerate() {
            out[i + j] ^= mul(ai, bj);
        }
    }
    out
}

/// `dst[i] ^= c * src[i]` for all `i`.
pub fn addmul_slice(dst: &mut [u8], src: &[u8], c: u8) {
    if c == 0 {
        return;
    }
    for (d, &s) in dst.iter_mut().zip(src) {
        *d ^= mul(s, c);
    }
}

/// `dst[i] ^= src[i]` for all `i`.
pub fn xor_slice(dst: &mut [u8], src: &[u8]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

//! Systematic Reed-Solomon over GF(2^8), and the interleaved per-block
//! inner code built on top of it.
//!
//! # Conventions
//! Codewords are high-first: `cw[0]` is the coefficient of x^(n-1), the
//! parity symbols occupy the last `nsym` positions.  The generator has
//! roots α^0 .. α^(nsym-1), so syndromes are `S_j = r(α^j)`.
//!
//! Decoding is errors-only (no erasure hints): Berlekamp-Massey yields the
//! locator Λ, a Chien search finds its roots, and Forney's formula gives
//! the magnitudes.  Up to `nsym / 2` symbol errors per codeword are
//! corrected; anything more is reported as [`RsError::TooManyErrors`],
//! never silently miscorrected past a final syndrome check.

use thiserror::Error;

use super::gf256::{
    alpha_pow, alpha_pow_neg, div, eval_high_first, eval_low_first, mul, poly_mul,
};

/// Longest codeword GF(256) supports.
pub const MAX_CODEWORD_LEN: usize = 255;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RsError {
    #[error("codeword length {0} exceeds {MAX_CODEWORD_LEN}")]
    TooLong(usize),
    #[error("more errors than the code can correct")]
    TooManyErrors,
}

// ── Single codeword ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReedSolomon {
    nsym:      usize,
    /// High-first, monic, degree `nsym`.
    generator: Vec<u8>,
}

impl ReedSolomon {
    /// `nsym` parity symbols per codeword; must be in `1..MAX_CODEWORD_LEN`.
    pub fn new(nsym: usize) -> Self {
        debug_assert!(nsym > 0 && nsym < MAX_CODEWORD_LEN);
        let mut generator = vec![1u8];
        for i in 0..nsym {
            generator = poly_mul(&generator, &[1, alpha_pow(i)]);
        }
        Self { nsym, generator }
    }

    pub fn nsym(&self) -> usize { self.nsym }

    /// Largest message that still fits one codeword.
    pub fn max_data_len(&self) -> usize { MAX_CODEWORD_LEN - self.nsym }

    /// Write the parity of `msg` into `parity` (`parity.len() == nsym`).
    pub fn encode_parity(&self, msg: &[u8], parity: &mut [u8]) {
        debug_assert_eq!(parity.len(), self.nsym);
        debug_assert!(msg.len() <= self.max_data_len());
        parity.fill(0);
        for &m in msg {
            let feedback = m ^ parity[0];
            parity.copy_within(1.., 0);
            parity[self.nsym - 1] = 0;
            if feedback != 0 {
                for (p, &g) in parity.iter_mut().zip(&self.generator[1..]) {
                    *p ^= mul(g, feedback);
                }
            }
        }
    }

    /// Syndromes `S_0 .. S_(nsym-1)`, low-first.
    pub fn syndromes(&self, cw: &[u8]) -> Vec<u8> {
        (0..self.nsym).map(|j| eval_high_first(cw, alpha_pow(j))).collect()
    }

    /// Correct `cw` in place.  Returns the number of symbols fixed.
    ///
    /// On error `cw` may be partially modified; callers work on a copy.
    pub fn correct(&self, cw: &mut [u8]) -> Result<usize, RsError> {
        let n = cw.len();
        if n > MAX_CODEWORD_LEN {
            return Err(RsError::TooLong(n));
        }

        let synd = self.syndromes(cw);
        if synd.iter().all(|&s| s == 0) {
            return Ok(0);
        }

        let (lambda, errors) = berlekamp_massey(&synd);
        if errors == 0 || 2 * errors > self.nsym || lambda.len() != errors + 1 {
            return Err(RsError::TooManyErrors);
        }

        // Chien search: position p carries exponent e = n-1-p, and is in
        // error when Λ(α^-e) = 0.
        let positions: Vec<usize> = (0..n)
            .filter(|&p| eval_low_first(&lambda, alpha_pow_neg(n - 1 - p)) == 0)
            .collect();
        if positions.len() != errors {
            return Err(RsError::TooManyErrors);
        }

        // Forney: Ω = S·Λ mod x^nsym, e_k = X_k · Ω(X_k⁻¹) / Λ'(X_k⁻¹).
        let mut omega = poly_mul(&synd, &lambda);
        omega.truncate(self.nsym);
        let lambda_prime: Vec<u8> = (1..lambda.len())
            .map(|i| if i % 2 == 1 { lambda[i] } else { 0 })
            .collect();

        for &p in &positions {
            let e = n - 1 - p;
            let x_inv = alpha_pow_neg(e);
            let denom = eval_low_first(&lambda_prime, x_inv);
            if denom == 0 {
                return Err(RsError::TooManyErrors);
            }
            let magnitude = mul(alpha_pow(e), div(eval_low_first(&omega, x_inv), denom));
            cw[p] ^= magnitude;
        }

        if self.syndromes(cw).iter().any(|&s| s != 0) {
            return Err(RsError::TooManyErrors);
        }
        Ok(errors)
    }
}

/// Returns the error locator Λ (low-first, trailing zeros trimmed) and the
/// linear complexity L, which equals the error count when decoding succeeds.
fn berlekamp_massey(synd: &[u8]) -> (Vec<u8>, usize) {
    let mut c = vec![1u8];
    let mut b = vec![1u8];
    let mut l = 0usize;
    let mut m = 1usize;
    let mut last_d = 1u8;

    for n in 0..synd.len() {
        let mut d = synd[n];
        for i in 1..=l.min(c.len() - 1) {
            d ^= mul(c[i], synd[n - i]);
        }

        if d == 0 {
            m += 1;
            continue;
        }

        let coef = div(d, last_d);
        let snapshot = (2 * l <= n).then(|| c.clone());
        if c.len() < b.len() + m {
            c.resize(b.len() + m, 0);
        }
        for (i, &bi) in b.iter().enumerate() {
            c[i + m] ^= mul(coef, bi);
        }

        match snapshot {
            Some(t) => {
                l = n + 1 - l;
                b = t;
                last_d = d;
                m = 1;
            }
            None => m += 1,
        }
    }

    while c.len() > 1 && c[c.len() - 1] == 0 {
        c.pop();
    }
    (c, l)
}

// ── Interleaved inner code ───────────────────────────────────────────────────

/// Inner code for one fixed-size block.
///
/// The block is spread over `c = ceil(block_size / (255 - nsym))` shortened
/// codewords; byte `j` belongs to codeword `j % c`.  Interleaving turns a
/// burst of adjacent damaged bytes into a few errors per codeword.
#[derive(Debug, Clone)]
pub struct InnerCode {
    rs:         ReedSolomon,
    block_size: usize,
    codewords:  usize,
}

impl InnerCode {
    pub fn new(block_size: usize, nsym: usize) -> Self {
        let rs = ReedSolomon::new(nsym);
        let codewords = block_size.div_ceil(rs.max_data_len()).max(1);
        Self { rs, block_size, codewords }
    }

    pub fn codewords(&self) -> usize { self.codewords }

    pub fn parity_len(&self) -> usize { self.codewords * self.rs.nsym() }

    /// Byte errors each codeword can absorb.
    pub fn correctable_per_codeword(&self) -> usize { self.rs.nsym() / 2 }

    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        debug_assert_eq!(payload.len(), self.block_size);
        let nsym = self.rs.nsym();
        let mut parity = vec![0u8; self.parity_len()];
        let mut msg = Vec::with_capacity(MAX_CODEWORD_LEN);
        for (i, out) in parity.chunks_exact_mut(nsym).enumerate() {
            msg.clear();
            msg.extend(payload.iter().skip(i).step_by(self.codewords));
            self.rs.encode_parity(&msg, out);
        }
        parity
    }

    /// `true` when every codeword has zero syndromes.
    pub fn is_clean(&self, payload: &[u8], parity: &[u8]) -> bool {
        let nsym = self.rs.nsym();
        let mut cw = Vec::with_capacity(MAX_CODEWORD_LEN);
        parity.chunks_exact(nsym).enumerate().all(|(i, p)| {
            cw.clear();
            cw.extend(payload.iter().skip(i).step_by(self.codewords));
            cw.extend_from_slice(p);
            self.rs.syndromes(&cw).iter().all(|&s| s == 0)
        })
    }

    /// Correct `payload` and `parity` in place.  Returns the number of bytes
    /// fixed across all codewords.
    pub fn correct(&self, payload: &mut [u8], parity: &mut [u8]) -> Result<usize, RsError> {
        if payload.len() != self.block_size || parity.len() != self.parity_len() {
            return Err(RsError::TooManyErrors);
        }
        let nsym = self.rs.nsym();
        let mut cw = Vec::with_capacity(MAX_CODEWORD_LEN);
        let mut fixed = 0usize;

        for (i, p) in parity.chunks_exact_mut(nsym).enumerate() {
            cw.clear();
            cw.extend(payload.iter().skip(i).step_by(self.codewords));
            let k = cw.len();
            cw.extend_from_slice(p);

            let n = self.rs.correct(&mut cw)?;
            if n == 0 {
                continue;
            }
            for (j, &b) in cw[..k].iter().enumerate() {
                payload[i + j * self.codewords] = b;
            }
            p.copy_from_slice(&cw[k..]);
            fixed += n;
        }
        Ok(fixed)
    }
}

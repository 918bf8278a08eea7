//! Reference erasure code.
//!
//! Systematic Reed-Solomon style coding over the prime field GF(257). The
//! object (prefixed with its length and zero-padded) is cut into K rows;
//! fragment `i` holds the evaluations at `x = i` of the polynomials that
//! pass through the rows, so fragments `0..K` are the rows themselves and
//! any K fragments determine the rest. Symbols are stored as big-endian
//! `u16` because 256 is a valid field element.

use tessera_core::{Fragment, Object, Result, TesseraError, VersionKey};

const P: u32 = 257;

fn mul(a: u32, b: u32) -> u32 {
    (a * b) % P
}

fn sub(a: u32, b: u32) -> u32 {
    (a + P - b) % P
}

fn pow(mut base: u32, mut exp: u32) -> u32 {
    let mut acc = 1;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = mul(acc, base);
        }
        base = mul(base, base);
        exp >>= 1;
    }
    acc
}

fn inv(a: u32) -> u32 {
    pow(a, P - 2)
}

/// Lagrange basis weights for evaluating at `x` from samples at `points`.
fn weights(points: &[u32], x: u32) -> Vec<u32> {
    points
        .iter()
        .enumerate()
        .map(|(s, &xs)| {
            points
                .iter()
                .enumerate()
                .filter(|(t, _)| *t != s)
                .fold(1, |acc, (_, &xt)| mul(acc, mul(sub(x, xt), inv(sub(xs, xt)))))
        })
        .collect()
}

/// K-of-N erasure codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolyCodec;

impl PolyCodec {
    /// Encode `object` into `n` fragments, any `k` of which recover it.
    pub fn encode(&self, object: &Object, n: u32, k: u32) -> Result<Vec<Fragment>> {
        if k == 0 || k > n || n >= P {
            return Err(TesseraError::invalid(format!("unsupported coding parameters {k}-of-{n}")));
        }
        let k = k as usize;
        let mut bytes = (object.data.len() as u64).to_be_bytes().to_vec();
        bytes.extend_from_slice(&object.data);
        let row_len = bytes.len().div_ceil(k);
        bytes.resize(row_len * k, 0);
        let rows: Vec<&[u8]> = bytes.chunks(row_len).collect();
        let points: Vec<u32> = (0..k as u32).collect();

        Ok((0..n)
            .map(|x| {
                let w = weights(&points, x);
                let mut payload = Vec::with_capacity(row_len * 2);
                for j in 0..row_len {
                    let value = rows
                        .iter()
                        .zip(&w)
                        .fold(0, |acc, (row, wr)| (acc + mul(row[j] as u32, *wr)) % P);
                    payload.extend_from_slice(&(value as u16).to_be_bytes());
                }
                Fragment::new(payload)
            })
            .collect())
    }

    /// Recover an object from any `k` present fragments.
    pub fn decode(&self, key: &VersionKey, fragments: &[Option<Fragment>], k: u32) -> Result<Object> {
        let present: Vec<(u32, &Fragment)> = fragments
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.as_ref().map(|f| (i as u32, f)))
            .take(k as usize)
            .collect();
        if present.len() < k as usize || k == 0 {
            return Err(TesseraError::NotEnoughFragments {
                key: *key,
                checked: fragments.len(),
                found: present.len(),
            });
        }
        let width = present[0].1.len();
        if width % 2 != 0 || present.iter().any(|(_, f)| f.len() != width) {
            return Err(TesseraError::encoding("fragment sizes disagree"));
        }
        let symbols: Vec<Vec<u32>> = present
            .iter()
            .map(|(_, f)| {
                f.payload
                    .chunks(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]) as u32)
                    .collect()
            })
            .collect();
        if symbols.iter().flatten().any(|s| *s >= P) {
            return Err(TesseraError::encoding("symbol outside the field"));
        }
        let points: Vec<u32> = present.iter().map(|(x, _)| *x).collect();
        let row_len = width / 2;

        let mut bytes = Vec::with_capacity(row_len * k as usize);
        for row in 0..k {
            let w = weights(&points, row);
            for j in 0..row_len {
                let value = symbols
                    .iter()
                    .zip(&w)
                    .fold(0, |acc, (column, ws)| (acc + mul(column[j], *ws)) % P);
                let byte = u8::try_from(value)
                    .map_err(|_| TesseraError::encoding("decoded symbol is not a byte"))?;
                bytes.push(byte);
            }
        }
        if bytes.len() < 8 {
            return Err(TesseraError::encoding("decoded data too short"));
        }
        let (prefix, rest) = bytes.split_at(8);
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(prefix);
        let len = u64::from_be_bytes(len_bytes) as usize;
        if len > rest.len() {
            return Err(TesseraError::encoding("decoded length exceeds data"));
        }
        Ok(Object::new(*key, rest[..len].to_vec()))
    }
}

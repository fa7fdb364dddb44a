#[cfg(test)]
mod rand_test;

use std::time::{SystemTime, UNIX_EPOCH};

use rand::{thread_rng, Rng};

const RUNES_CANDIDATE_ID_FOUNDATION: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789/+";

// Digits used by the base-32 rendering of credential material. All of them
// are ICE-chars (ALPHA / DIGIT / "+" / "/").
const BASE32_DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuv";

const MIN_UFRAG_LEN: usize = 4;
const MIN_PWD_LEN: usize = 22;

pub fn generate_crypto_random_string(n: usize, runes: &[u8]) -> String {
    let mut rng = thread_rng();

    let rand_string: String = (0..n)
        .map(|_| {
            let idx = rng.gen_range(0..runes.len());
            runes[idx] as char
        })
        .collect();

    rand_string
}

/// Renders `v` in base 32 with the lowercase extended-hex digit set.
fn to_base32(mut v: u128) -> String {
    if v == 0 {
        return "0".to_owned();
    }

    let mut out = vec![];
    while v > 0 {
        out.push(BASE32_DIGITS[(v % 32) as usize]);
        v /= 32;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// <https://tools.ietf.org/html/rfc5245#section-15.1>
/// candidate-id = "candidate" ":" foundation
/// foundation   = 1*32ice-char
/// ice-char     = ALPHA / DIGIT / "+" / "/"
pub fn generate_cand_id() -> String {
    format!(
        "candidate:{}",
        generate_crypto_random_string(32, RUNES_CANDIDATE_ID_FOUNDATION)
    )
}

/// Generates the local ICE ufrag: a 24-bit random integer concatenated with a
/// base-32 tag of the current time, padded up to the minimum length.
pub fn generate_ufrag() -> String {
    let random24 = u128::from(rand::random::<u32>() & 0x00FF_FFFF);
    let time_tag = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let mut ufrag = to_base32(random24) + &to_base32(u128::from(time_tag));
    while ufrag.len() < MIN_UFRAG_LEN {
        ufrag.push(BASE32_DIGITS[rand::random::<usize>() % 32] as char);
    }

    ufrag
}

/// Generates the local ICE pwd: base-32 of a 128-bit random integer.
pub fn generate_pwd() -> String {
    let mut pwd = to_base32(rand::random::<u128>());
    while pwd.len() < MIN_PWD_LEN {
        pwd.push(BASE32_DIGITS[rand::random::<usize>() % 32] as char);
    }

    pwd
}

//! SHA-512 password hashing in the `$6$` format understood by glibc `crypt(3)`.

use rand::RngCore;
use sha2::{Digest, Sha512};

const ALPHABET: &[u8; 64] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

pub const SALT_LENGTH: usize = 16;
pub const DEFAULT_ROUNDS: u32 = 5000;
const MIN_ROUNDS: u32 = 1000;
const MAX_ROUNDS: u32 = 999_999_999;

/// Prefixes of the hash formats a password may already be stored in.
const CRYPTED_PREFIXES: &[&str] = &["$2b$", "$6$", "$5$"];

/// Whether `password` already looks like a crypt(3) hash.
pub fn is_crypted(password: &str) -> bool {
    CRYPTED_PREFIXES.iter().any(|p| password.starts_with(p))
}

/// Salt of [`SALT_LENGTH`] characters drawn from `rng`.
pub fn gen_salt(rng: &mut dyn RngCore) -> String {
    (0..SALT_LENGTH)
        .map(|_| ALPHABET[(rng.next_u32() % 64) as usize] as char)
        .collect()
}

/// Hash `password` with a fresh salt from `rng`.
pub fn crypt_sha512(password: &str, rng: &mut dyn RngCore) -> String {
    sha512_crypt(password, &gen_salt(rng), None)
}

/// Hash a password unless it is already hashed.
pub fn ensure_crypted(password: &str, rng: &mut dyn RngCore) -> String {
    if is_crypted(password) {
        password.to_string()
    } else {
        crypt_sha512(password, rng)
    }
}

fn repeat_digest(digest: &[u8], len: usize) -> Vec<u8> {
    digest.iter().copied().cycle().take(len).collect()
}

/// The SHA-crypt algorithm. Salts longer than 16 bytes are truncated and
/// `rounds` is clamped to the range glibc accepts.
pub fn sha512_crypt(password: &str, salt: &str, rounds: Option<u32>) -> String {
    let key = password.as_bytes();
    let salt = &salt.as_bytes()[..salt.len().min(SALT_LENGTH)];
    let n_rounds = rounds.map_or(DEFAULT_ROUNDS, |r| r.clamp(MIN_ROUNDS, MAX_ROUNDS));

    let alternate = Sha512::new()
        .chain_update(key)
        .chain_update(salt)
        .chain_update(key)
        .finalize();

    let mut ctx = Sha512::new().chain_update(key).chain_update(salt);
    ctx.update(repeat_digest(&alternate, key.len()));
    let mut bits = key.len();
    while bits > 0 {
        if bits & 1 == 1 {
            ctx.update(&alternate);
        } else {
            ctx.update(key);
        }
        bits >>= 1;
    }
    let mut result = ctx.finalize();

    let mut dp = Sha512::new();
    for _ in 0..key.len() {
        dp.update(key);
    }
    let p = repeat_digest(&dp.finalize(), key.len());

    let mut ds = Sha512::new();
    for _ in 0..16 + usize::from(result[0]) {
        ds.update(salt);
    }
    let s = repeat_digest(&ds.finalize(), salt.len());

    for round in 0..n_rounds {
        let mut c = Sha512::new();
        if round & 1 == 1 {
            c.update(&p);
        } else {
            c.update(&result);
        }
        if round % 3 != 0 {
            c.update(&s);
        }
        if round % 7 != 0 {
            c.update(&p);
        }
        if round & 1 == 1 {
            c.update(&result);
        } else {
            c.update(&p);
        }
        result = c.finalize();
    }

    let mut out = String::from("$6$");
    if rounds.is_some() {
        out.push_str(&format!("rounds={n_rounds}$"));
    }
    out.push_str(&String::from_utf8_lossy(salt));
    out.push('$');
    encode(&result, &mut out);
    out
}

fn push_b64(out: &mut String, b2: u8, b1: u8, b0: u8, n: usize) {
    let mut w = (u32::from(b2) << 16) | (u32::from(b1) << 8) | u32::from(b0);
    for _ in 0..n {
        out.push(ALPHABET[(w & 0x3f) as usize] as char);
        w >>= 6;
    }
}

fn encode(digest: &[u8], out: &mut String) {
    let (mut a, mut b, mut c) = (0usize, 21usize, 42usize);
    for _ in 0..21 {
        push_b64(out, digest[a], digest[b], digest[c], 4);
        (a, b, c) = (b + 1, c + 1, a + 1);
    }
    push_b64(out, 0, 0, digest[63], 2);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn recognizes_hashed_passwords() {
        assert!(is_crypted("$2b$04$123465789012345678901uac5A8egfBuZVHMrDZsQzR96IqNBivCy"));
        assert!(is_crypted("$5$1234567890123456$v.2bOKKLlpmUSKn0rxJmgnh.e3wOKivAVNZmNrOsoA3"));
        assert!(is_crypted("$6$1234567890123456$d.pgKQFaiD8bRiExg5NesbGR"));
        assert!(!is_crypted("$7$123456789012345"));
        assert!(!is_crypted("password"));
    }

    #[test]
    fn glibc_vectors() {
        assert_eq!(
            sha512_crypt("Hello world!", "saltstring", None),
            "$6$saltstring$svn8UoSVapNtMuq1ukKS4tPQd8iKwSMHWjl/O817G3uBnIFNjnQJuesI68u4OTLiBFdcbYEdFCoEOfaS35inz1"
        );
        assert_eq!(
            sha512_crypt("Hello world!", "saltstringsaltstring", Some(10000)),
            "$6$rounds=10000$saltstringsaltst$OW1/O6BYHV6BcXZu8QVeXbDWra3Oeqh0sbHbbMCVNSnCM/UrjmM0Dp8vOuZeHBy/YTBmSK6H9qs/y3RnOaw5v."
        );
    }

    #[test]
    fn seeded_salts_are_reproducible() {
        let a = crypt_sha512("testPass", &mut StdRng::seed_from_u64(7));
        let b = crypt_sha512("testPass", &mut StdRng::seed_from_u64(7));
        let c = crypt_sha512("testPass", &mut StdRng::seed_from_u64(8));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("$6$"));
        assert_eq!(a.split('$').nth(2).unwrap().len(), SALT_LENGTH);
    }

    #[test]
    fn already_hashed_is_kept() {
        let hashed = "$6$saltstring$svn8UoSVapNtMuq1ukKS4tPQd8iKwSMHWjl";
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(ensure_crypted(hashed, &mut rng), hashed);
        assert!(ensure_crypted("secret", &mut rng).starts_with("$6$"));
    }
}

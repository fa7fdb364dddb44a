use std::collections::HashSet;

use super::*;

fn is_ice_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '+' || c == '/'
}

#[test]
fn test_generate_ufrag_shape() {
    for _ in 0..64 {
        let ufrag = generate_ufrag();
        assert!(
            (4..=256).contains(&ufrag.len()),
            "ufrag length out of range: {}",
            ufrag.len()
        );
        assert!(ufrag.chars().all(is_ice_char), "non ice-char in {}", ufrag);
    }
}

#[test]
fn test_generate_pwd_shape() {
    for _ in 0..64 {
        let pwd = generate_pwd();
        assert!(
            (22..=256).contains(&pwd.len()),
            "pwd length out of range: {}",
            pwd.len()
        );
        assert!(pwd.chars().all(is_ice_char), "non ice-char in {}", pwd);
    }
}

#[test]
fn test_random_generator_collision() {
    let mut seen = HashSet::new();
    for _ in 0..100 {
        assert!(seen.insert(generate_pwd()), "generated a colliding pwd");
    }
}

#[test]
fn test_to_base32() {
    assert_eq!(to_base32(0), "0");
    assert_eq!(to_base32(31), "v");
    assert_eq!(to_base32(32), "10");
}

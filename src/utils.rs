use crate::peer::types::ServerConfig;
use rand::Rng;
use sha2::{Digest, Sha256};

const MEETING_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Код встречи: `len` символов из A-Z0-9. Коллизии не проверяются.
pub fn meeting_code(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| MEETING_ALPHABET[rng.random_range(0..MEETING_ALPHABET.len())] as char)
        .collect()
}

/// Короткий отпечаток полезной нагрузки для сопоставления в логах обеих сторон
pub fn fingerprint(payload: &str) -> String {
    let digest = Sha256::digest(payload.as_bytes());
    hex::encode(&digest[..6])
}

// Функция для добавления схемы протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
    {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(kind: &str, url: &str) -> ServerConfig {
        ServerConfig {
            id: "s".into(),
            r#type: kind.into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    #[test]
    fn meeting_code_is_uppercase_alphanumeric() {
        for _ in 0..50 {
            let code = meeting_code(7);
            assert_eq!(code.len(), 7);
            assert!(code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn adds_missing_scheme() {
        assert_eq!(
            add_ice_url_scheme(&server("turn", "turn.example.org:3478")),
            "turn:turn.example.org:3478"
        );
        assert_eq!(
            add_ice_url_scheme(&server("stun", "stun:stun.example.org")),
            "stun:stun.example.org"
        );
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_eq!(fingerprint("abc").len(), 12);
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
    }
}

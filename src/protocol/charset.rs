//! Charset names, collation indexes and statement encoding

use bytes::Bytes;

/// (collation index, charset name) for the collations backends negotiate most
const COLLATIONS: &[(u8, &str)] = &[
    (8, "latin1"),
    (11, "ascii"),
    (33, "utf8"),
    (45, "utf8mb4"),
    (47, "latin1"),
    (48, "latin1"),
    (63, "binary"),
    (65, "ascii"),
    (83, "utf8"),
    (192, "utf8"),
    (224, "utf8mb4"),
    (255, "utf8mb4"),
];

/// Charset name for a collation index
pub fn name_of(index: u8) -> Option<&'static str> {
    COLLATIONS
        .iter()
        .find(|(i, _)| *i == index)
        .map(|(_, name)| *name)
}

/// Default collation index for a charset name
pub fn index_of(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    COLLATIONS
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(i, _)| *i)
}

/// Encode `text` in `charset`.
///
/// Returns `None` when the charset is not supported or cannot represent the text.
pub fn encode(text: &str, charset: &str) -> Option<Bytes> {
    match charset.to_ascii_lowercase().as_str() {
        "utf8" | "utf8mb4" | "utf8mb3" | "binary" => Some(Bytes::copy_from_slice(text.as_bytes())),
        "ascii" => text
            .is_ascii()
            .then(|| Bytes::copy_from_slice(text.as_bytes())),
        "latin1" => text
            .chars()
            .map(|c| u8::try_from(u32::from(c)).ok())
            .collect::<Option<Vec<u8>>>()
            .map(Bytes::from),
        _ => None,
    }
}

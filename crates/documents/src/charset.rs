//! Windows-1252 output for the accounting system and the PDF base fonts.

use encoding_rs::WINDOWS_1252;

const REPLACEMENT: u8 = b'?';

/// Encodes `text` as Windows-1252. Characters outside the code page become `?`.
pub fn encode_legacy(text: &str) -> Vec<u8> {
    let (encoded, _, had_errors) = WINDOWS_1252.encode(text);
    if !had_errors {
        return encoded.into_owned();
    }

    let mut bytes = Vec::with_capacity(text.len());
    let mut buffer = [0_u8; 4];
    for ch in text.chars() {
        let (single, _, unmappable) = WINDOWS_1252.encode(ch.encode_utf8(&mut buffer));
        if unmappable {
            bytes.push(REPLACEMENT);
        } else {
            bytes.extend_from_slice(&single);
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::encode_legacy;

    #[test]
    fn maps_nordic_letters_and_euro_sign() {
        assert_eq!(encode_legacy("Ä ö €"), vec![0xC4, b' ', 0xF6, b' ', 0x80]);
    }

    #[test]
    fn unmappable_characters_become_question_marks() {
        assert_eq!(encode_legacy("a→b"), b"a?b".to_vec());
        assert_eq!(encode_legacy("plain ascii"), b"plain ascii".to_vec());
    }
}

// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use encoding_rs::{Encoding, GBK, UTF_8};
use log::debug;
use regex::Regex;

/// Charset tried when the declared one cannot decode the bytes.
pub const FALLBACK_CHARSET: &str = "gbk";

/// Encoded words in the wild frequently drop base64 padding.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode MIME encoded-word headers (RFC 2047)
/// Supports both Q-encoding and B-encoding
/// Format: =?charset?encoding?encoded-text?=
///
/// Each word is decoded with its declared charset. Whitespace separating two
/// adjacent encoded words is dropped.
pub fn decode_mime_header(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENCODED_WORD_RE: Regex = Regex::new(
            r"=\?([^?\s]+)\?([BbQq])\?([^?\s]*)\?="
        ).expect("encoded-word pattern is valid");
    }

    let mut result = String::new();
    let mut last_end = 0;
    let mut previous_was_word = false;

    for cap in ENCODED_WORD_RE.captures_iter(input) {
        let (full_match, [charset, encoding, encoded_text]) = cap.extract();
        let Some(whole) = cap.get(0) else { continue };

        let between = &input[last_end..whole.start()];
        if !(previous_was_word && between.trim().is_empty()) {
            result.push_str(between);
        }

        let bytes = match encoding {
            "B" | "b" => LENIENT_BASE64.decode(encoded_text).ok(),
            _ => Some(decode_q_encoding(encoded_text.as_bytes())),
        };

        match bytes {
            Some(bytes) => result.push_str(&decode_header_bytes(&bytes, Some(charset))),
            None => result.push_str(full_match),
        }

        last_end = whole.end();
        previous_was_word = true;
    }

    result.push_str(&input[last_end..]);
    result
}

/// Header text never fails to decode: declared charset, then GBK, then lossy UTF-8.
fn decode_header_bytes(bytes: &[u8], charset: Option<&str>) -> String {
    decode_text(bytes, charset).unwrap_or_else(|| String::from_utf8_lossy(bytes).into_owned())
}

/// Decode raw (unencoded) header bytes, which some senders fill with 8-bit text.
pub fn decode_raw_header(bytes: &[u8]) -> String {
    decode_mime_header(&decode_header_bytes(bytes, None))
}

/// Strictly decode `bytes` with `charset` (UTF-8 when absent), retrying with
/// GBK. Returns `None` when neither produces valid text.
pub fn decode_text(bytes: &[u8], charset: Option<&str>) -> Option<String> {
    let declared = charset.map(normalize_charset).unwrap_or("utf-8");

    if let Some(text) = decode_declared(declared, bytes) {
        return Some(text);
    }

    debug!(
        "Charset '{}' could not decode {} bytes, retrying with {}",
        declared,
        bytes.len(),
        FALLBACK_CHARSET
    );
    decode_strict(GBK, bytes)
}

fn normalize_charset(label: &str) -> &str {
    // RFC 2231 language suffix: utf-8*en
    label.split('*').next().unwrap_or(label).trim().trim_matches('"')
}

fn decode_declared(label: &str, bytes: &[u8]) -> Option<String> {
    // encoding_rs maps ASCII labels to windows-1252, which accepts any byte
    if is_ascii_label(label) {
        return if bytes.is_ascii() { decode_strict(UTF_8, bytes) } else { None };
    }
    lookup_encoding(label).and_then(|enc| decode_strict(enc, bytes))
}

fn is_ascii_label(label: &str) -> bool {
    const ASCII_LABELS: [&str; 7] = [
        "us-ascii",
        "ascii",
        "us_ascii",
        "us",
        "ansi_x3.4-1968",
        "iso646-us",
        "csascii",
    ];
    ASCII_LABELS.iter().any(|ascii| label.eq_ignore_ascii_case(ascii))
}

fn lookup_encoding(label: &str) -> Option<&'static Encoding> {
    if label.eq_ignore_ascii_case("utf8") {
        return Some(UTF_8);
    }
    Encoding::for_label(label.as_bytes())
}

fn decode_strict(encoding: &'static Encoding, bytes: &[u8]) -> Option<String> {
    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|text| text.into_owned())
}

/// RFC 2047 Q encoding: `_` is a space, `=XX` a hex octet.
fn decode_q_encoding(bytes: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'=' => {
                let hex = (
                    bytes.get(i + 1).and_then(|b| hex_value(*b)),
                    bytes.get(i + 2).and_then(|b| hex_value(*b)),
                );
                if let (Some(h), Some(l)) = hex {
                    result.push(h << 4 | l);
                    i += 3;
                } else {
                    // Not a valid hex sequence, treat as literal
                    result.push(b'=');
                    i += 1;
                }
            }
            b'_' => {
                result.push(b' ');
                i += 1;
            }
            b => {
                result.push(b);
                i += 1;
            }
        }
    }

    result
}

fn hex_value(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Latest-message preview on top of `mailparse`.
//!
//! `mailparse` owns the RFC 822 / MIME structure and transfer decoding. Text
//! is charset-decoded here so a part whose declared charset is wrong can be
//! retried as GBK. Anything that still cannot be decoded degrades to
//! placeholder text.

use log::debug;
use mailparse::{MailHeaderMap, ParsedMail};

use crate::imap::types::LatestMail;
use crate::utils::mime_decoder::{decode_raw_header, decode_text};

pub const UNSUPPORTED_BODY: &str = "无法解析正文 (格式不支持)";
pub const UNDECODABLE_BODY: &str = "无法解析正文";

/// Subject, sender and preferred body of a raw message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub subject: String,
    pub sender: String,
    pub content: String,
}

impl From<ParsedMessage> for LatestMail {
    fn from(msg: ParsedMessage) -> Self {
        LatestMail::new(msg.sender, msg.subject, msg.content)
    }
}

/// Parse a full RFC 822 message as returned by `FETCH (RFC822)`.
pub fn parse_message(raw: &[u8]) -> ParsedMessage {
    let mail = match mailparse::parse_mail(raw) {
        Ok(mail) => mail,
        Err(e) => {
            debug!("Unparseable message ({} bytes): {}", raw.len(), e);
            return ParsedMessage {
                subject: String::new(),
                sender: String::new(),
                content: UNDECODABLE_BODY.to_string(),
            };
        }
    };

    let subject = header_text(&mail, "Subject");
    let sender = header_text(&mail, "From");

    let content = if mail.ctype.mimetype.starts_with("multipart/") {
        let mut leaves = Vec::new();
        collect_leaves(&mail, &mut leaves);
        select_body(&leaves).unwrap_or_else(|| {
            debug!("No decodable html or plain part among {} parts", leaves.len());
            UNSUPPORTED_BODY.to_string()
        })
    } else {
        decoded_text(&mail).unwrap_or_else(|| UNDECODABLE_BODY.to_string())
    };

    ParsedMessage { subject, sender, content }
}

/// Header values are decoded from the raw bytes so 8-bit text and
/// mislabelled encoded words get the GBK retry.
fn header_text(mail: &ParsedMail<'_>, name: &str) -> String {
    mail.headers
        .get_first_header(name)
        .map(|header| {
            // Unfold: drop the line breaks, keep the leading whitespace
            let unfolded: Vec<u8> = header
                .get_value_raw()
                .iter()
                .copied()
                .filter(|b| !matches!(b, b'\r' | b'\n'))
                .collect();
            decode_raw_header(&unfolded).trim().to_string()
        })
        .unwrap_or_default()
}

/// Every non-multipart part, depth first in document order.
fn collect_leaves<'a, 'b>(mail: &'b ParsedMail<'a>, out: &mut Vec<&'b ParsedMail<'a>>) {
    if mail.subparts.is_empty() {
        out.push(mail);
    }
    for part in &mail.subparts {
        collect_leaves(part, out);
    }
}

/// First html part wins, then the first plain-text part. Text attachments are
/// candidates too.
fn select_body(leaves: &[&ParsedMail<'_>]) -> Option<String> {
    let first_of = |mimetype: &str| {
        leaves
            .iter()
            .filter(|part| part.ctype.mimetype == mimetype)
            .find_map(|part| decoded_text(part))
    };

    first_of("text/html").or_else(|| first_of("text/plain"))
}

/// Transfer-decoded bytes, then the declared charset (UTF-8 when absent)
/// with the GBK retry.
fn decoded_text(part: &ParsedMail<'_>) -> Option<String> {
    let bytes = match part.get_body_raw() {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Undecodable {} transfer encoding: {}", part.ctype.mimetype, e);
            return None;
        }
    };
    // `ctype.charset` defaults to us-ascii; only an explicit label counts
    let charset = part.ctype.params.get("charset").map(String::as_str);
    decode_text(&bytes, charset)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "From: a@b.com\r\n\
        Subject: Welcome\r\n\
        Content-Type: text/plain; charset=utf-8\r\n\
        \r\n\
        Hello there\r\n";

    #[test]
    fn test_single_part_plain() {
        let msg = parse_message(SIMPLE.as_bytes());
        assert_eq!(msg.subject, "Welcome");
        assert_eq!(msg.sender, "a@b.com");
        assert_eq!(msg.content.trim_end(), "Hello there");
    }

    #[test]
    fn test_encoded_and_folded_subject() {
        let raw = "Subject: =?UTF-8?B?5L2g5aW9?=\r\n =?UTF-8?Q?_world?=\r\n\
            From: =?utf-8?B?5byg5LiJ?= <zhang@example.com>\r\n\
            \r\n\
            body";
        let msg = parse_message(raw.as_bytes());
        assert_eq!(msg.subject, "你好 world");
        assert_eq!(msg.sender, "张三 <zhang@example.com>");
    }

    #[test]
    fn test_folded_plain_subject_keeps_words_apart() {
        let raw = "Subject: Quarterly\r\n report\r\n\r\nbody";
        assert_eq!(parse_message(raw.as_bytes()).subject, "Quarterly report");
    }

    #[test]
    fn test_mislabelled_encoded_word_decodes_as_gbk() {
        // GBK bytes for "你好" declared as utf-8
        let raw = "Subject: =?utf-8?B?xOO6ww==?=\r\n\r\nbody";
        assert_eq!(parse_message(raw.as_bytes()).subject, "你好");
    }

    #[test]
    fn test_missing_headers_are_empty() {
        let msg = parse_message(b"\r\njust a body");
        assert_eq!(msg.subject, "");
        assert_eq!(msg.sender, "");
        assert_eq!(msg.content, "just a body");
    }

    #[test]
    fn test_multipart_prefers_html() {
        let raw = "From: news@shop.com\r\n\
            Subject: Sale\r\n\
            Content-Type: multipart/alternative; boundary=\"XYZ\"\r\n\
            \r\n\
            preamble\r\n\
            --XYZ\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            \r\n\
            plain version\r\n\
            --XYZ\r\n\
            Content-Type: text/html; charset=utf-8\r\n\
            Content-Transfer-Encoding: base64\r\n\
            \r\n\
            PGI+aHRtbDwvYj4=\r\n\
            --XYZ--\r\n\
            epilogue\r\n";
        let msg = parse_message(raw.as_bytes());
        assert_eq!(msg.content, "<b>html</b>");
    }

    #[test]
    fn test_multipart_falls_back_to_plain() {
        let raw = "Content-Type: multipart/mixed; boundary=b1\r\n\
            \r\n\
            --b1\r\n\
            Content-Type: text/plain; charset=gbk\r\n\
            Content-Transfer-Encoding: base64\r\n\
            \r\n\
            xOO6ww==\r\n\
            --b1\r\n\
            Content-Type: application/pdf\r\n\
            Content-Disposition: attachment; filename=\"a.pdf\"\r\n\
            \r\n\
            JVBERi0=\r\n\
            --b1--\r\n";
        let msg = parse_message(raw.as_bytes());
        assert_eq!(msg.content, "你好");
    }

    #[test]
    fn test_text_attachment_is_a_body_candidate() {
        let raw = "Content-Type: multipart/mixed; boundary=b\r\n\
            \r\n\
            --b\r\n\
            Content-Type: image/png\r\n\
            \r\n\
            data\r\n\
            --b\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            Content-Disposition: attachment; filename=\"notes.txt\"\r\n\
            \r\n\
            attached notes\r\n\
            --b--\r\n";
        let msg = parse_message(raw.as_bytes());
        assert!(msg.content.starts_with("attached notes"));
    }

    #[test]
    fn test_nested_multipart() {
        let raw = "Content-Type: multipart/mixed; boundary=outer\r\n\
            \r\n\
            --outer\r\n\
            Content-Type: multipart/alternative; boundary=inner\r\n\
            \r\n\
            --inner\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            plain\r\n\
            --inner\r\n\
            Content-Type: text/html\r\n\
            \r\n\
            <p>nested</p>\r\n\
            --inner--\r\n\
            --outer\r\n\
            Content-Type: image/png\r\n\
            Content-Transfer-Encoding: base64\r\n\
            \r\n\
            iVBORw0KGgo=\r\n\
            --outer--\r\n";
        let msg = parse_message(raw.as_bytes());
        assert!(msg.content.starts_with("<p>nested</p>"));
    }

    #[test]
    fn test_multipart_without_text_uses_placeholder() {
        let raw = "Content-Type: multipart/mixed; boundary=b\r\n\
            \r\n\
            --b\r\n\
            Content-Type: image/png\r\n\
            \r\n\
            data\r\n\
            --b--\r\n";
        let msg = parse_message(raw.as_bytes());
        assert_eq!(msg.content, "无法解析正文 (格式不支持)");
    }

    #[test]
    fn test_undecodable_single_part_uses_placeholder() {
        let mut raw = b"Content-Type: text/plain; charset=utf-8\r\n\r\n".to_vec();
        raw.push(0xff);
        let msg = parse_message(&raw);
        assert_eq!(msg.content, "无法解析正文");
    }

    #[test]
    fn test_mislabelled_utf8_body_decodes_as_gbk() {
        let mut raw = b"Content-Type: text/plain; charset=utf-8\r\n\r\n".to_vec();
        raw.extend_from_slice(&[0xc4, 0xe3, 0xba, 0xc3]);
        let msg = parse_message(&raw);
        assert_eq!(msg.content, "你好");
    }

    #[test]
    fn test_us_ascii_body_with_8bit_bytes_decodes_as_gbk() {
        let mut raw = b"Content-Type: text/plain; charset=us-ascii\r\n\r\n".to_vec();
        raw.extend_from_slice(&[0xc4, 0xe3, 0xba, 0xc3]);
        assert_eq!(parse_message(&raw).content, "你好");
    }

    #[test]
    fn test_missing_charset_reads_utf8() {
        let raw = "Content-Type: text/plain\r\n\r\ncafé";
        assert_eq!(parse_message(raw.as_bytes()).content, "café");
    }

    #[test]
    fn test_quoted_printable_body() {
        let raw = "Content-Type: text/plain; charset=utf-8\r\n\
            Content-Transfer-Encoding: quoted-printable\r\n\
            \r\n\
            caf=C3=A9 au =\r\nlait";
        assert_eq!(parse_message(raw.as_bytes()).content, "café au lait");
    }

    #[test]
    fn test_into_latest_mail() {
        let mail: LatestMail = parse_message(SIMPLE.as_bytes()).into();
        assert_eq!(mail.identifier.as_deref(), Some("Welcome|a@b.com"));
    }
}

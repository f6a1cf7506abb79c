//! Cleartext renderings of a draft body for MIME and plain-text recipients.

use std::fmt::Write;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::replica::Attachment;

/// Maximum encoded line length in a MIME body.
const LINE_LENGTH: usize = 76;

/// Render `html` and the cached attachment data as a `multipart/mixed` body.
///
/// Attachments without cleartext in memory are left out.
#[must_use]
pub fn build_mime(html: &str, attachments: &[Attachment], boundary: &str) -> String {
    let mut message = String::new();

    let _ = writeln!(message, "Content-Type: multipart/mixed; boundary=\"{boundary}\"\r");
    message.push_str("MIME-Version: 1.0\r\n");
    message.push_str("\r\n");

    let _ = writeln!(message, "--{boundary}\r");
    message.push_str("Content-Type: text/html; charset=utf-8\r\n");
    message.push_str("Content-Transfer-Encoding: base64\r\n");
    message.push_str("\r\n");
    push_base64(&mut message, html.as_bytes());

    for attachment in attachments {
        let Some(data) = &attachment.file_data else {
            continue;
        };
        let name = attachment.file_name.replace('"', "");
        let _ = writeln!(message, "--{boundary}\r");
        let _ = writeln!(message, "Content-Type: {}; name=\"{name}\"\r", attachment.mime_type);
        message.push_str("Content-Transfer-Encoding: base64\r\n");
        match &attachment.content_id {
            Some(content_id) => {
                let _ = writeln!(message, "Content-Disposition: inline; filename=\"{name}\"\r");
                let _ = writeln!(message, "Content-ID: <{content_id}>\r");
            }
            None => {
                let _ = writeln!(message, "Content-Disposition: attachment; filename=\"{name}\"\r");
            }
        }
        message.push_str("\r\n");
        push_base64(&mut message, data);
    }

    let _ = writeln!(message, "--{boundary}--\r");
    message
}

fn push_base64(message: &mut String, data: &[u8]) {
    let encoded = STANDARD.encode(data);
    let mut rest = encoded.as_str();
    while !rest.is_empty() {
        let (line, tail) = rest.split_at(rest.len().min(LINE_LENGTH));
        message.push_str(line);
        message.push_str("\r\n");
        rest = tail;
    }
}

/// Convert an HTML body into readable plain text.
///
/// # Errors
///
/// Returns an error if the HTML cannot be converted.
pub fn html_to_plain(html: &str) -> std::io::Result<String> {
    htmd::convert(html).map(|text| text.trim().to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_includes_cached_attachments_only() {
        let cached = Attachment::new_local("m-1", "a.txt", "text/plain", b"hello".to_vec());
        let uploaded = Attachment {
            file_data: None,
            ..Attachment::new_local("m-1", "b.txt", "text/plain", Vec::new())
        };

        let body = build_mime("<p>Hi</p>", &[cached, uploaded], "b1");

        assert!(body.starts_with("Content-Type: multipart/mixed; boundary=\"b1\"\r\n"));
        assert!(body.contains("filename=\"a.txt\""));
        assert!(!body.contains("b.txt"));
        assert!(body.contains(&STANDARD.encode("hello")));
        assert!(body.ends_with("--b1--\r\n"));
    }

    #[test]
    fn test_inline_attachment_has_content_id() {
        let mut inline = Attachment::new_local("m-1", "logo.png", "image/png", vec![1, 2, 3]);
        inline.content_id = Some("logo@local".into());

        let body = build_mime("", &[inline], "b2");
        assert!(body.contains("Content-Disposition: inline"));
        assert!(body.contains("Content-ID: <logo@local>"));
    }

    #[test]
    fn test_long_bodies_are_wrapped() {
        let html = "x".repeat(400);
        let body = build_mime(&html, &[], "b3");
        assert!(body.lines().all(|line| line.trim_end_matches('\r').len() <= LINE_LENGTH));
    }

    #[test]
    fn test_html_to_plain_drops_markup() {
        let plain = html_to_plain("<p>Hello <b>there</b></p>").unwrap();
        assert!(plain.contains("Hello"));
        assert!(!plain.contains("<p>"));
    }
}

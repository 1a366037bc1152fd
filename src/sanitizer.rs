//! Strips headers that reveal where a message came from and gives it a new
//! `Message-ID`.
//!
//! The body is never inspected; apart from line ending normalisation it
//! leaves exactly as it arrived.

use phf::phf_set;
use rand::Rng;

const CRLF: &[u8] = b"\r\n";

/// Lowercase names of headers removed from every relayed message.
static DENY_LIST: phf::Set<&'static str> = phf_set! {
    // Routing trace
    "received",
    "x-received",
    "return-path",
    "delivered-to",
    "x-forwarded-to",
    "x-forwarded-for",
    "x-original-to",
    // Client origin
    "x-originating-ip",
    "x-sender",
    "x-ms-exchange-organization-authas",
    "x-ms-exchange-organization-authmechanism",
    "x-ms-exchange-organization-authsource",
    // Mail agent
    "x-mailer",
    "user-agent",
    // Signatures and authentication results
    "dkim-signature",
    "x-google-dkim-signature",
    "x-gm-message-state",
    "x-google-smtp-source",
    "arc-seal",
    "arc-message-signature",
    "arc-authentication-results",
    "authentication-results",
    // Spam scoring
    "x-spam-status",
    "x-spam-score",
    "x-spam-flag",
};

/// Whether a header called `name` is stripped, ignoring case.
fn is_denied(name: &str) -> bool {
    DENY_LIST.contains(name.trim().to_ascii_lowercase().as_str())
}

/// A header and its folded continuation lines.
#[derive(Debug)]
struct Record<'a> {
    /// Lowercased; `None` for lines that are not `name: value` shaped.
    name: Option<String>,
    lines: Vec<&'a [u8]>,
}

/// Sanitise a raw message, using `domain` for the generated `Message-ID`.
///
/// Output always has CRLF line endings, exactly one `Message-ID` header and
/// a blank line separating headers from the (possibly empty) body. The first
/// `Message-ID` is replaced where it stood; any later ones are dropped.
/// Folded lines with no header above them are dropped too.
pub fn sanitize(raw: &[u8], domain: &str) -> Vec<u8> {
    let message = normalise_line_endings(raw);
    let (head, body) = split(&message);
    let message_id = generate_message_id(domain);

    let mut output = Vec::with_capacity(message.len() + message_id.len() + 16);
    let mut replaced = false;

    for record in parse_headers(head) {
        match record.name.as_deref() {
            Some(name) if is_denied(name) => {}
            Some("message-id") => {
                if !replaced {
                    write_message_id(&mut output, &message_id);
                    replaced = true;
                }
            }
            _ => {
                for line in record.lines {
                    output.extend_from_slice(line);
                    output.extend_from_slice(CRLF);
                }
            }
        }
    }

    if !replaced {
        write_message_id(&mut output, &message_id);
    }

    output.extend_from_slice(CRLF);
    if let Some(body) = body {
        output.extend_from_slice(body);
    }

    output
}

/// `<unix-nanos.random@domain>`, unique per call.
pub fn generate_message_id(domain: &str) -> String {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let nonce = rand::rng().random::<u64>();

    format!("<{nanos}.{nonce}@{domain}>")
}

fn write_message_id(output: &mut Vec<u8>, message_id: &str) {
    output.extend_from_slice(b"Message-ID: ");
    output.extend_from_slice(message_id.as_bytes());
    output.extend_from_slice(CRLF);
}

/// Rewrite bare `\n` as `\r\n`. Existing `\r\n` pairs and lone `\r` are kept.
fn normalise_line_endings(raw: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(raw.len() + raw.len() / 32);
    let mut index = 0;

    while index < raw.len() {
        match raw[index] {
            b'\r' if raw.get(index + 1) == Some(&b'\n') => {
                output.extend_from_slice(CRLF);
                index += 2;
            }
            b'\n' => {
                output.extend_from_slice(CRLF);
                index += 1;
            }
            byte => {
                output.push(byte);
                index += 1;
            }
        }
    }

    output
}

/// Split at the first blank line. The separator itself belongs to neither
/// half; `None` means the message had no separator at all.
fn split(message: &[u8]) -> (&[u8], Option<&[u8]>) {
    if let Some(body) = message.strip_prefix(CRLF) {
        return (&[], Some(body));
    }

    message
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map_or((message, None), |end| {
            (&message[..end], Some(&message[end + 4..]))
        })
}

fn parse_headers(head: &[u8]) -> Vec<Record<'_>> {
    let mut records: Vec<Record<'_>> = Vec::new();

    let lines = head
        .split(|byte| *byte == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.is_empty());

    for line in lines {
        if matches!(line[0], b' ' | b'\t') {
            if let Some(parent) = records.last_mut() {
                parent.lines.push(line);
            }
            continue;
        }

        let name = match line.iter().position(|byte| *byte == b':') {
            Some(colon) if colon > 0 => Some(
                String::from_utf8_lossy(&line[..colon])
                    .trim()
                    .to_ascii_lowercase(),
            ),
            _ => None,
        };

        records.push(Record {
            name,
            lines: vec![line],
        });
    }

    records
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const DOMAIN: &str = "out.example";

    fn header_keys(message: &[u8]) -> Vec<String> {
        let (headers, _) = mailparse::parse_headers(message).unwrap();
        headers.iter().map(mailparse::MailHeader::get_key).collect()
    }

    fn message_ids(message: &[u8]) -> Vec<String> {
        let (headers, _) = mailparse::parse_headers(message).unwrap();
        headers
            .iter()
            .filter(|header| header.get_key().eq_ignore_ascii_case("message-id"))
            .map(mailparse::MailHeader::get_value)
            .collect()
    }

    fn body(message: &[u8]) -> &[u8] {
        let end = message
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .unwrap();
        &message[end + 4..]
    }

    #[test]
    fn test_strips_source_headers() {
        let raw = b"From: a@x.com\r\nTo: b@y.com\r\nSubject: Hi\r\nReceived: from z\r\nX-Mailer: Foo\r\nDKIM-Signature: v=1\r\n\r\nhello";

        let output = sanitize(raw, DOMAIN);

        assert_eq!(
            header_keys(&output),
            vec!["From", "To", "Subject", "Message-ID"]
        );
        assert_eq!(body(&output), b"hello");

        let ids = message_ids(&output);
        assert_eq!(ids.len(), 1);
        assert!(ids[0].starts_with('<'));
        assert!(ids[0].ends_with("@out.example>"));
    }

    #[test]
    fn test_every_denied_header_is_removed() {
        let mut raw = b"From: a@x.com\r\n".to_vec();
        for name in DENY_LIST.iter() {
            raw.extend_from_slice(format!("{name}: value\r\n").as_bytes());
        }
        raw.extend_from_slice(b"\r\nbody");

        let output = sanitize(&raw, DOMAIN);
        assert_eq!(header_keys(&output), vec!["From", "Message-ID"]);
    }

    #[test]
    fn test_case_insensitive() {
        for line in ["RECEIVED: from a", "Received: from a", "received: from a", "ReCeIvEd : from a"] {
            let raw = format!("From: a@x.com\r\n{line}\r\n\r\nbody");
            let output = sanitize(raw.as_bytes(), DOMAIN);
            assert_eq!(header_keys(&output), vec!["From", "Message-ID"], "{line}");
        }

        assert!(is_denied("X-Spam-Flag"));
        assert!(!is_denied("Subject"));
    }

    #[test]
    fn test_round_trip_preserves_clean_message() {
        let raw = b"From: a@x.com\r\nTo: b@y.com\r\nSubject: Test\r\nContent-Type: text/plain\r\n\r\nLine one\r\nLine two\r\n";

        let output = sanitize(raw, DOMAIN);
        let (head, rest) = output.split_at(output.len() - b"\r\nLine one\r\nLine two\r\n".len());

        assert!(head.starts_with(b"From: a@x.com\r\nTo: b@y.com\r\nSubject: Test\r\nContent-Type: text/plain\r\nMessage-ID: <"));
        assert!(head.ends_with(b"@out.example>\r\n"));
        assert_eq!(rest, b"\r\nLine one\r\nLine two\r\n");
        assert_eq!(message_ids(&output).len(), 1);
    }

    #[test]
    fn test_replaces_message_id_in_place() {
        let raw = b"From: a@x.com\r\nMessage-ID: <original@sender.local>\r\nSubject: Hi\r\n\r\nbody";

        let output = sanitize(raw, DOMAIN);

        assert_eq!(header_keys(&output), vec!["From", "Message-ID", "Subject"]);
        let ids = message_ids(&output);
        assert_eq!(ids.len(), 1);
        assert_ne!(ids[0], "<original@sender.local>");
        assert!(!output.windows(8).any(|window| window == b"original"));
    }

    #[test]
    fn test_duplicate_message_ids_collapse() {
        let raw = b"Message-ID: <one@a>\r\nFrom: a@x.com\r\nmessage-id: <two@b>\r\n\r\nbody";

        let output = sanitize(raw, DOMAIN);
        assert_eq!(header_keys(&output), vec!["Message-ID", "From"]);
    }

    #[test]
    fn test_message_ids_are_unique() {
        let raw = b"From: a@x.com\r\n\r\nbody";

        let first = message_ids(&sanitize(raw, DOMAIN));
        let second = message_ids(&sanitize(raw, DOMAIN));
        assert_ne!(first, second);

        assert_ne!(generate_message_id(DOMAIN), generate_message_id(DOMAIN));
    }

    #[test]
    fn test_folded_headers_follow_parent() {
        let raw = b"From: a@x.com\r\nReceived: from host\r\n\tby relay.local\r\n  with ESMTP\r\nSubject: A long\r\n subject line\r\n\r\nbody";

        let output = sanitize(raw, DOMAIN);
        let text = String::from_utf8(output).unwrap();

        assert!(!text.contains("relay.local"));
        assert!(!text.contains("with ESMTP"));
        assert!(text.contains("Subject: A long\r\n subject line\r\n"));
    }

    #[test]
    fn test_folded_line_containing_colon() {
        let raw = b"Subject: meeting\r\n received: not a header\r\n\r\nbody";

        let output = sanitize(raw, DOMAIN);
        let text = String::from_utf8(output).unwrap();

        assert!(text.starts_with("Subject: meeting\r\n received: not a header\r\n"));
    }

    #[test]
    fn test_orphan_folded_lines_are_dropped() {
        let raw = b" X-Mailer: hidden\r\n\tSubject: orphan\r\nSubject: Hi\r\n\r\nbody";

        let output = sanitize(raw, DOMAIN);
        let text = String::from_utf8(output).unwrap();

        assert_eq!(header_keys(text.as_bytes()), vec!["Subject", "Message-ID"]);
        assert!(text.starts_with("Subject: Hi\r\n"));
        assert!(!text.contains("hidden"));
        assert!(!text.contains("orphan"));
    }

    #[test]
    fn test_anonymous_lines_are_kept() {
        let raw = b"From: a@x.com\r\nnot a header\r\n: leading colon\r\n\r\nbody";

        let output = sanitize(raw, DOMAIN);
        let text = String::from_utf8(output).unwrap();

        assert!(text.contains("\r\nnot a header\r\n"));
        assert!(text.contains("\r\n: leading colon\r\n"));
    }

    #[test]
    fn test_body_resembling_headers_is_untouched() {
        let raw = b"From: a@x.com\r\n\r\nReceived: from inside the body\r\nX-Mailer: also body\r\n";

        let output = sanitize(raw, DOMAIN);
        assert_eq!(
            body(&output),
            b"Received: from inside the body\r\nX-Mailer: also body\r\n"
        );
    }

    #[test]
    fn test_empty_body() {
        let output = sanitize(b"From: a@x.com\r\n\r\n", DOMAIN);

        assert!(output.ends_with(b">\r\n\r\n"));
        assert_eq!(body(&output), b"");
    }

    #[test]
    fn test_headers_only() {
        let output = sanitize(b"From: a@x.com\r\nSubject: Hi", DOMAIN);

        assert_eq!(header_keys(&output), vec!["From", "Subject", "Message-ID"]);
        assert!(output.ends_with(b">\r\n\r\n"));
    }

    #[test]
    fn test_bare_line_feeds_are_normalised() {
        let output = sanitize(b"From: a@x.com\nReceived: x\nSubject: Hi\n\nline one\nline two\n", DOMAIN);

        assert_eq!(header_keys(&output), vec!["From", "Subject", "Message-ID"]);
        assert_eq!(body(&output), b"line one\r\nline two\r\n");
        assert!(!output
            .windows(2)
            .enumerate()
            .any(|(index, window)| window[1] == b'\n' && window[0] != b'\r' && index > 0));
    }

    #[test]
    fn test_leading_blank_line_means_no_headers() {
        let output = sanitize(b"\r\nFrom: inside body\r\n", DOMAIN);

        assert_eq!(header_keys(&output), vec!["Message-ID"]);
        assert_eq!(body(&output), b"From: inside body\r\n");
    }

    #[test]
    fn test_single_blank_line_between_headers_and_body() {
        let output = sanitize(b"From: a@x.com\r\n\r\nbody", DOMAIN);

        assert!(!output.windows(6).any(|window| window == b"\r\n\r\n\r\n"));
    }
}
